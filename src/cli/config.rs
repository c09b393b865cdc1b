use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{ClientFullConfig, ConfigSource};

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    // 其他用户或同组用户可读（o+r / g+r）
    if mode & 0o044 != 0 {
        warn!(
            "Config file '{}' is readable by other users (permissions: {:o}), \
             it contains the login token. Consider: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 目录下所有 .toml 文件（按文件名排序）
pub fn list_config_dir(dir: &str) -> Result<Vec<String>> {
    let dir = expand_path(dir)?;
    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
        .with_context(|| format!("Failed to read config directory: {}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    files.sort();

    if files.is_empty() {
        anyhow::bail!("No .toml configuration found in {}", dir);
    }

    files
        .into_iter()
        .map(|path| {
            path.to_str()
                .map(|s| s.to_string())
                .ok_or_else(|| anyhow::anyhow!("Invalid path: {:?}", path))
        })
        .collect()
}

/// 根据命令行参数确定所有配置来源
pub fn collect_sources(
    files: &[String],
    config_dir: Option<&str>,
    token: Option<&str>,
    tunnel_ids: &[String],
    api: &str,
) -> Result<Vec<ConfigSource>> {
    let mut sources = Vec::new();

    for file in files {
        let path = expand_path(file)?;
        check_config_file_permissions(&path)?;
        sources.push(ConfigSource::file(&path));
    }

    if let Some(dir) = config_dir {
        for path in list_config_dir(dir)? {
            check_config_file_permissions(&path)?;
            sources.push(ConfigSource::file(&path));
        }
    }

    if let Some(token) = token {
        for id in tunnel_ids.iter().map(|id| id.trim()).filter(|id| !id.is_empty()) {
            sources.push(ConfigSource::remote(api, token, id));
        }
    }

    if sources.is_empty() {
        anyhow::bail!("No configuration given, use --config, --config-dir or --token/--tunnel-id");
    }
    Ok(sources)
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);
    let result = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", config_path))
        .and_then(|content| ClientFullConfig::parse(&content));

    match result {
        Ok(config) => {
            let mut warnings = Vec::new();
            if config.client.token.is_empty() {
                warnings.push("token is empty".to_string());
            }
            if let Some(ca) = &config.client.ca_cert_path {
                if !ca.exists() {
                    warnings.push(format!("CA certificate file not found: {:?}", ca));
                }
            }

            if format == "json" {
                let proxies: Vec<_> = config
                    .proxies
                    .iter()
                    .map(|p| {
                        serde_json::json!({
                            "name": p.name,
                            "type": p.proxy_type,
                            "local": p.local_addr(),
                            "remote_port": p.remote_port,
                        })
                    })
                    .collect();
                let visitors: Vec<_> = config
                    .visitors
                    .iter()
                    .map(|v| {
                        serde_json::json!({
                            "name": v.name,
                            "type": v.proxy_type,
                            "server_name": v.server_name,
                            "bind": v.bind_address(),
                        })
                    })
                    .collect();
                let result = CheckResult {
                    valid: true,
                    warnings,
                    error: None,
                    details: serde_json::json!({
                        "server": config.client.server_address(),
                        "transport": config.client.transport,
                        "tcp_mux": config.client.tcp_mux,
                        "proxies": proxies,
                        "visitors": visitors,
                    }),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Checking configuration file: {}\n", config_path);
                println!("✓ Server: {}", config.client.server_address());
                println!(
                    "✓ Transport: {}{}",
                    config.client.transport,
                    if config.client.tcp_mux { " (mux)" } else { "" }
                );
                println!("✓ Number of proxies: {}", config.proxies.len());
                for (idx, proxy) in config.proxies.iter().enumerate() {
                    println!(
                        "  Proxy #{}: '{}' ({}, local={}, remote_port={})",
                        idx + 1,
                        proxy.name,
                        proxy.proxy_type,
                        proxy.local_addr(),
                        proxy.remote_port
                    );
                }
                println!("✓ Number of visitors: {}", config.visitors.len());
                for (idx, visitor) in config.visitors.iter().enumerate() {
                    println!(
                        "  Visitor #{}: '{}' ({} -> '{}', bind={})",
                        idx + 1,
                        visitor.name,
                        visitor.proxy_type,
                        visitor.server_name,
                        visitor.bind_address()
                    );
                }
                for warning in &warnings {
                    println!("⚠ Warning: {}", warning);
                }
                println!("\n✓ Client configuration is valid!");
            }
            Ok(())
        }
        Err(e) => {
            if format == "json" {
                let result = CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("revtun-{}-{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_expand_path_absolute() {
        let path = expand_path("relative.toml").unwrap();
        assert!(Path::new(&path).is_absolute());
        assert!(path.ends_with("relative.toml"));
    }

    #[test]
    fn test_list_config_dir_sorted_toml_only() {
        let dir = temp_dir("dir");
        std::fs::write(dir.join("b.toml"), "").unwrap();
        std::fs::write(dir.join("a.toml"), "").unwrap();
        std::fs::write(dir.join("notes.txt"), "").unwrap();

        let files = list_config_dir(dir.to_str().unwrap()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.toml"));
        assert!(files[1].ends_with("b.toml"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_collect_remote_sources() {
        let sources = collect_sources(
            &[],
            None,
            Some("t0k"),
            &["1".to_string(), " ".to_string(), "2".to_string()],
            "http://api.local/v1",
        )
        .unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[1], ConfigSource::remote("http://api.local/v1", "t0k", "2"));
    }

    #[test]
    fn test_collect_requires_some_source() {
        assert!(collect_sources(&[], None, None, &[], "http://api.local").is_err());
    }

    #[test]
    fn test_check_config_reports_invalid() {
        let dir = temp_dir("check");
        let path = dir.join("bad.toml");
        std::fs::write(&path, "[client]\nserver_addr = \"\"\n").unwrap();
        assert!(check_config(path.to_str().unwrap(), "json").is_err());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
