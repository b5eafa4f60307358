use crate::cli::{
    actions::{Action, server::Args},
    commands,
};
use anyhow::{Context, Result};
use secrecy::SecretString;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(commands::ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;
    let token_secret = matches
        .get_one::<String>(commands::ARG_TOKEN_SECRET)
        .cloned()
        .map(SecretString::from)
        .context("missing required argument: --token-secret")?;
    let frontend_url = matches
        .get_one::<String>(commands::ARG_FRONTEND_URL)
        .cloned()
        .unwrap_or_else(|| "http://localhost:3000".to_string());
    let outbox_poll_seconds = matches
        .get_one::<u64>(commands::ARG_OUTBOX_POLL_SECONDS)
        .copied()
        .unwrap_or(5);
    let outbox_batch_size = matches
        .get_one::<usize>(commands::ARG_OUTBOX_BATCH_SIZE)
        .copied()
        .unwrap_or(10);
    let outbox_max_attempts = matches
        .get_one::<u32>(commands::ARG_OUTBOX_MAX_ATTEMPTS)
        .copied()
        .unwrap_or(5);

    Ok(Action::Server(Args {
        port,
        dsn,
        token_secret,
        frontend_url,
        outbox_poll_seconds,
        outbox_batch_size,
        outbox_max_attempts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::actions::Action;

    #[test]
    fn handler_builds_server_action() -> Result<()> {
        let matches = commands::new().get_matches_from(vec![
            "idento",
            "--dsn",
            "postgres://localhost/idento",
            "--token-secret",
            "secret",
            "--port",
            "8181",
        ]);
        let Action::Server(args) = handler(&matches)?;
        assert_eq!(args.port, 8181);
        assert_eq!(args.dsn, "postgres://localhost/idento");
        assert_eq!(args.frontend_url, "http://localhost:3000");
        assert_eq!(args.outbox_batch_size, 10);
        Ok(())
    }
}
