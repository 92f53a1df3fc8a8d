use async_trait::async_trait;
use broker_trait::BrokerAdapter;
use manager::{Account, BrokerFactory};
use std::sync::Arc;

/// Resolves an [`Account`]'s `broker_type` against the concrete adapter
/// crates wired into this binary. Unknown `broker_type` values are a
/// config error, not a panic.
pub struct LiveBrokerFactory;

fn credential<'a>(account: &'a Account, key: &str) -> anyhow::Result<&'a str> {
    account
        .credentials
        .0
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| anyhow::anyhow!("account {} missing credential '{key}'", account.id))
}

fn credential_or<'a>(account: &'a Account, key: &str, default: &'a str) -> &'a str {
    account.credentials.0.get(key).map(|s| s.as_str()).unwrap_or(default)
}

#[async_trait]
impl BrokerFactory for LiveBrokerFactory {
    async fn build(&self, account: &Account) -> anyhow::Result<Arc<dyn BrokerAdapter>> {
        match account.broker_type.as_str() {
            "gateway" => {
                let base_url = credential(account, "base_url")?;
                let token = credential(account, "token")?;
                let broker_account_id = credential_or(account, "account_id", &account.id);
                Ok(Arc::new(gateway_broker::GatewayBroker::new(base_url, token, broker_account_id)))
            }
            "oanda" => {
                let base_url = credential(account, "base_url")?;
                let stream_url = credential(account, "stream_url")?;
                let token = credential(account, "token")?;
                let broker_account_id = credential_or(account, "account_id", &account.id);
                Ok(Arc::new(oanda_broker::OandaBroker::new(
                    base_url,
                    stream_url,
                    token,
                    broker_account_id,
                )))
            }
            "ctrader" | "dxtrade" | "matchtrader" => {
                let platform = platform_broker::models::Platform::parse(&account.broker_type)
                    .ok_or_else(|| anyhow::anyhow!("unknown platform broker_type {}", account.broker_type))?;
                let base_url = credential(account, "base_url")?;
                let broker_account_id = credential_or(account, "account_id", &account.id);
                let password = credential(account, "password")?;
                let server_name = credential_or(account, "server_name", "");
                let paper = credential_or(account, "paper", "true") == "true";
                Ok(Arc::new(platform_broker::PlatformBroker::new(
                    platform,
                    base_url,
                    broker_account_id,
                    password,
                    server_name,
                    paper,
                )))
            }
            "terminal" => {
                let login = credential_or(account, "login", &account.id);
                let server = credential_or(account, "server", "demo");
                let platform = credential_or(account, "platform", "mt5");
                Ok(Arc::new(terminal_bridge::TerminalBridge::new(login, server, platform)))
            }
            other => Err(anyhow::anyhow!("unknown broker_type '{other}' for account {}", account.id)),
        }
    }
}
