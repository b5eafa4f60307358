//! The onboarding step plans and the entitlements granted at completion.

/// Ordered steps for an individual account.
pub const INDIVIDUAL_STEPS: [&str; 5] = ["profile", "contact", "preferences", "security", "review"];

/// Ordered steps for business and hybrid accounts.
pub const BUSINESS_STEPS: [&str; 8] = [
    "profile",
    "contact",
    "business_details",
    "tax_info",
    "bank_account",
    "documents",
    "security",
    "review",
];

/// Steps a user may skip and still complete onboarding.
const SKIPPABLE: [&str; 2] = ["preferences", "documents"];

const INDIVIDUAL_ENTITLEMENTS: [&str; 3] = ["storefront_access", "wishlist", "order_tracking"];
const BUSINESS_EXTRA_ENTITLEMENTS: [&str; 3] =
    ["seller_tools", "analytics_dashboard", "bulk_listing"];

/// The step plan for an account type. Hybrid accounts walk the business plan.
pub fn steps_for(account_type: &str) -> &'static [&'static str] {
    match account_type {
        "business" | "hybrid" => &BUSINESS_STEPS,
        _ => &INDIVIDUAL_STEPS,
    }
}

pub fn is_valid_step(account_type: &str, step: &str) -> bool {
    steps_for(account_type).contains(&step)
}

pub fn is_skippable(step: &str) -> bool {
    SKIPPABLE.contains(&step)
}

/// Merge a newly recorded step into a saved list. Re-saving a step is
/// idempotent: no duplicates, existing order preserved.
pub fn merge_step(existing: &[String], step: &str) -> Vec<String> {
    let mut merged = existing.to_vec();
    if !merged.iter().any(|saved| saved == step) {
        merged.push(step.to_string());
    }
    merged
}

/// Steps still outstanding, in plan order.
pub fn next_steps(
    account_type: &str,
    completed: &[String],
    skipped: &[String],
) -> Vec<&'static str> {
    steps_for(account_type)
        .iter()
        .copied()
        .filter(|step| {
            !completed.iter().any(|done| done == step) && !skipped.iter().any(|s| s == step)
        })
        .collect()
}

/// Whether the plan is complete: every step is either done or legitimately
/// skipped.
pub fn is_complete(account_type: &str, completed: &[String], skipped: &[String]) -> bool {
    steps_for(account_type).iter().all(|step| {
        completed.iter().any(|done| done == step)
            || (is_skippable(step) && skipped.iter().any(|s| s == step))
    })
}

/// Entitlements granted when onboarding completes. Business and hybrid
/// accounts receive the individual set plus the seller features.
pub fn entitlements_for(account_type: &str) -> Vec<&'static str> {
    let mut entitlements: Vec<&'static str> = INDIVIDUAL_ENTITLEMENTS.to_vec();
    if matches!(account_type, "business" | "hybrid") {
        entitlements.extend(BUSINESS_EXTRA_ENTITLEMENTS);
    }
    entitlements
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(steps: &[&str]) -> Vec<String> {
        steps.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn plans_differ_by_account_type() {
        assert_eq!(steps_for("individual").len(), 5);
        assert_eq!(steps_for("business").len(), 8);
        assert_eq!(steps_for("hybrid"), steps_for("business"));
    }

    #[test]
    fn step_validation_follows_plan() {
        assert!(is_valid_step("individual", "preferences"));
        assert!(!is_valid_step("individual", "tax_info"));
        assert!(is_valid_step("business", "tax_info"));
    }

    #[test]
    fn merge_step_is_idempotent_and_keeps_order() {
        let saved = owned(&["profile", "contact"]);
        let merged = merge_step(&saved, "security");
        assert_eq!(merged, owned(&["profile", "contact", "security"]));

        // Saving the same step again changes nothing.
        assert_eq!(merge_step(&merged, "security"), merged);
        assert_eq!(merge_step(&merged, "profile"), merged);
        assert_eq!(merge_step(&[], "profile"), owned(&["profile"]));
    }

    #[test]
    fn next_steps_preserve_plan_order() {
        let completed = owned(&["contact", "profile"]);
        assert_eq!(
            next_steps("individual", &completed, &[]),
            vec!["preferences", "security", "review"]
        );
    }

    #[test]
    fn skipped_steps_drop_out_of_next() {
        let completed = owned(&["profile", "contact"]);
        let skipped = owned(&["preferences"]);
        assert_eq!(
            next_steps("individual", &completed, &skipped),
            vec!["security", "review"]
        );
    }

    #[test]
    fn completion_requires_every_required_step() {
        let completed = owned(&["profile", "contact", "security", "review"]);
        let skipped = owned(&["preferences"]);
        assert!(is_complete("individual", &completed, &skipped));

        // Skipping a non-skippable step does not count.
        let completed = owned(&["profile", "contact", "preferences", "review"]);
        let skipped = owned(&["security"]);
        assert!(!is_complete("individual", &completed, &skipped));

        // A fully completed plan needs no skips.
        let completed = owned(&INDIVIDUAL_STEPS);
        assert!(is_complete("individual", &completed, &[]));
    }

    #[test]
    fn entitlements_grow_with_account_type() {
        let individual = entitlements_for("individual");
        let business = entitlements_for("business");
        let hybrid = entitlements_for("hybrid");
        assert_eq!(individual.len(), 3);
        assert_eq!(business.len(), 6);
        assert_eq!(business, hybrid);
        for entitlement in &individual {
            assert!(business.contains(entitlement));
        }
    }
}
