use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "revtun")]
#[command(author, version, about = "Reverse tunnel client", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，RUST_LOG 优先
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行客户端（每个配置一个独立实例）
    Run {
        /// 配置文件路径（可重复）
        #[arg(short, long)]
        config: Vec<String>,

        /// 配置目录，目录下每个 .toml 文件启动一个实例
        #[arg(long, value_name = "DIR")]
        config_dir: Option<String>,

        /// 控制面用户令牌（远程获取配置时使用）
        #[arg(short, long, requires = "tunnel_id")]
        token: Option<String>,

        /// 远程隧道 ID，多个用逗号分隔
        #[arg(long, value_delimiter = ',', requires = "token")]
        tunnel_id: Vec<String>,

        /// 控制面 API 根地址
        #[arg(long, default_value = "http://127.0.0.1:8080/api/v1")]
        api: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式 (text, json)
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 输出示例客户端配置
    Template {
        /// 输出文件路径（默认打印到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
}
