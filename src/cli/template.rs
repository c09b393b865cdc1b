use anyhow::{Context, Result};

const CLIENT_TEMPLATE: &str = r#"# revtun client configuration

[client]
server_addr = "tunnel.example.com"
server_port = 7000
# tcp or tls
transport = "tcp"
# multiplex control and work connections over one physical connection
tcp_mux = false
user = ""
token = "change-me"
heartbeat_interval_secs = 30
heartbeat_timeout_multiplier = 3
login_timeout_secs = 10
work_conn_ready_timeout_secs = 10
nat_hole_timeout_secs = 10
login_fail_exit = false
# skip_verify = false
# ca_cert_path = "~/.revtun/ca.pem"
# api_url = "https://api.example.com/api"
# api_token = ""

[client.reconnect]
initial_delay_ms = 1000
max_delay_ms = 30000
jitter = 0.2

[[proxies]]
name = "ssh"
type = "tcp"
local_ip = "127.0.0.1"
local_port = 22
remote_port = 6000

[[proxies]]
name = "web"
type = "http"
local_port = 8080
custom_domains = ["web.example.com"]

[[proxies]]
name = "secret-ssh"
type = "stcp"
local_port = 22
sk = "shared-secret"

[[visitors]]
name = "secret-ssh-visitor"
type = "stcp"
server_name = "secret-ssh"
sk = "shared-secret"
bind_port = 9022
"#;

/// Generate configuration template
pub fn generate_config_template(output: Option<&str>) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, CLIENT_TEMPLATE)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated client configuration template: {}", path);
    } else {
        println!("{}", CLIENT_TEMPLATE);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientFullConfig;

    #[test]
    fn test_template_is_valid_config() {
        let config = ClientFullConfig::parse(CLIENT_TEMPLATE).unwrap();
        assert_eq!(config.proxies.len(), 3);
        assert_eq!(config.visitors.len(), 1);
    }
}
