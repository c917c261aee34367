use reqwest::Client;
use std::time::Duration;

const USER_AGENT: &str = concat!("catmatch/", env!("CARGO_PKG_VERSION"));

pub fn build_client(timeout: Duration, connect: Duration) -> Client {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .connect_timeout(connect)
        .build()
        .unwrap_or_else(|_| Client::new())
}
