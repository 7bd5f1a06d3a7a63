//! Gateway connectivity probe: `mission-control gateway-status`.

use anyhow::Result;
use mission_control::config::Settings;
use mission_control::control::gateway::GatewayStatus;

pub async fn cmd_gateway_status(settings: &Settings) -> Result<()> {
    let status = match settings.gateway_client()? {
        Some(client) => client.probe().await,
        None => GatewayStatus::not_configured(settings.openclaw_gateway_url.clone()),
    };
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
