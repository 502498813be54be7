use chrono::Duration;
use std::env;

/// Runtime configuration, loaded once at startup. The signing secret is
/// injected into the signer/verifier from here rather than read as ambient
/// state, so tests can run with fixed secrets.
pub struct Config {
    pub database_url: String,
    pub public_base_url: String,
    pub signing_secret: String,
    pub port: u16,
    /// Delay between delivery and the invitation send (default 24h).
    pub send_delay: Duration,
    /// Window after send_at during which the link stays redeemable (default 14 days).
    pub link_ttl: Duration,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: i64,
    pub max_attempts: i32,
}

impl Config {
    pub fn from_env() -> Config {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let signing_secret =
            env::var("REVIEW_LINK_SECRET").expect("REVIEW_LINK_SECRET must be set");
        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| String::from("http://localhost:7878"));

        Config {
            database_url,
            public_base_url,
            signing_secret,
            port: env_number("PORT", 7878),
            send_delay: Duration::hours(env_number("SEND_DELAY_HOURS", 24)),
            link_ttl: Duration::days(env_number("LINK_TTL_DAYS", 14)),
            sweep_interval_secs: env_number("SWEEP_INTERVAL_SECONDS", 600),
            sweep_batch_size: env_number("SWEEP_BATCH_SIZE", 200),
            max_attempts: env_number("MAX_SEND_ATTEMPTS", 3),
        }
    }
}

fn env_number<T: std::str::FromStr + Copy>(name: &str, fallback: T) -> T {
    match env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            log::warn!("Ignoring unparsable {} value {:?}.", name, value);
            fallback
        }),
        Err(_) => fallback,
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Config {
        Config {
            database_url: String::from(":memory:"),
            public_base_url: String::from("https://shop.example"),
            signing_secret: String::from("test-secret"),
            port: 0,
            send_delay: Duration::hours(24),
            link_ttl: Duration::days(14),
            sweep_interval_secs: 600,
            sweep_batch_size: 200,
            max_attempts: 3,
        }
    }
}
