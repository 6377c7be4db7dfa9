use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

// Request deadlines are set per call; painter uploads can be large.
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("sd_painter_bot/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("Failed to build HTTP client")
});

pub fn get_http_client() -> &'static Client {
    &HTTP_CLIENT
}
