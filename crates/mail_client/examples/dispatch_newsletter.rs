use mail_client::{HttpMailClient, MailClientConfig};
use mail_dispatch::{Dispatcher, DispatcherSettings, MessageRequest};

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

// --- Dispatcher Environment Variable Names ---
const ENV_DISPATCH_RATE_LIMIT: &str = "DISPATCH_RATE_LIMIT";
const ENV_DISPATCH_SENDER: &str = "DISPATCH_SENDER";
const ENV_DISPATCH_SENDER_NAME: &str = "DISPATCH_SENDER_NAME";
const ENV_NEWSLETTER_RECIPIENTS: &str = "NEWSLETTER_RECIPIENTS";

// Helper to parse environment variables with a default
fn get_env_var<T: FromStr + std::fmt::Debug>(var_name: &str, default_value: T) -> T
where
    <T as FromStr>::Err: std::fmt::Debug,
{
    env::var(var_name)
        .ok()
        .and_then(|val_str| match val_str.parse::<T>() {
            Ok(val) => Some(val),
            Err(e) => {
                warn!(
                    "Failed to parse env var '{}' (value: '{}'). Error: {:?}. Using default: {:?}",
                    var_name, val_str, e, default_value
                );
                None
            }
        })
        .unwrap_or(default_value)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let default_log_filter = "info,mail_client=info,mail_dispatch=debug";
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| default_log_filter.to_string()))
        .init();
    info!("Tracing initialized. RUST_LOG or default '{}' is active.", default_log_filter);

    // Also loads .env when present.
    let client = HttpMailClient::new(MailClientConfig::from_env()?)?;

    let settings = DispatcherSettings::builder()
        .rate_limit(get_env_var(ENV_DISPATCH_RATE_LIMIT, 14u32))
        .idle_poll_interval(Duration::from_secs(5))
        .default_sender_address(
            env::var(ENV_DISPATCH_SENDER).unwrap_or_else(|_| "newsletter@example.com".to_string()),
        )
        .default_sender_display_name(
            env::var(ENV_DISPATCH_SENDER_NAME).unwrap_or_else(|_| "Example Newsletter".to_string()),
        )
        .build();
    info!(?settings, "Dispatcher settings resolved");

    let dispatcher = Dispatcher::new(settings, client)?;
    dispatcher.on_success(|receipt| {
        info!(
            recipient = receipt.message.primary_recipient(),
            message_id = %receipt.response.message_id,
            "Newsletter delivered"
        );
        Ok(())
    });
    dispatcher.on_failure(|failure| {
        warn!(description = %failure.description(), "Newsletter not delivered");
        Ok(())
    });

    let handle = dispatcher.start()?;

    let recipients = env::var(ENV_NEWSLETTER_RECIPIENTS)
        .unwrap_or_else(|_| "ada@example.com,grace@example.com,alan@example.com".to_string());
    for (issue, recipient) in recipients
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .enumerate()
    {
        let request = MessageRequest::builder()
            .to(recipient)
            .subject("This month at Example")
            .body_html(format!("<p>Hello {recipient},</p><p>Here is what happened this month.</p>"))
            .build();
        dispatcher.enqueue_with(request, |message| {
            message
                .with_metadata("campaign", "monthly")
                .with_metadata("sequence", issue.to_string())
        })?;
    }
    info!(queued = dispatcher.len(), "Newsletter batch enqueued");

    if !dispatcher.wait_for_drain_timeout(Duration::from_secs(120)).await {
        warn!(remaining = dispatcher.len(), "Queue did not drain in time; stopping anyway");
    }
    handle.stop().await?;

    let stats = dispatcher.stats();
    info!(
        delivered = stats.delivered,
        failed = stats.failed,
        throttled = stats.throttled,
        "Newsletter run complete"
    );
    Ok(())
}
