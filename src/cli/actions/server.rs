use crate::api::{self, delivery::DeliveryWorkerConfig, handlers::auth::AuthConfig};
use anyhow::Result;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub token_secret: SecretString,
    pub frontend_url: String,
    pub outbox_poll_seconds: u64,
    pub outbox_batch_size: usize,
    pub outbox_max_attempts: u32,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let auth_config = AuthConfig::new(args.token_secret, args.frontend_url);

    let delivery_config = DeliveryWorkerConfig::new()
        .with_poll_interval_seconds(args.outbox_poll_seconds)
        .with_batch_size(args.outbox_batch_size)
        .with_max_attempts(args.outbox_max_attempts);

    api::new(args.port, args.dsn, auth_config, delivery_config).await
}
