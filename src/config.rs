use clap::Parser;

/// Multi-user chat server with named channels and private messaging.
#[derive(Parser, Debug, Clone)]
#[command(name = "relayd", version, about)]
pub struct ServerConfig {
    /// TCP listener address.
    #[arg(long, default_value = "0.0.0.0:6667")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6667".to_string(),
        }
    }
}
