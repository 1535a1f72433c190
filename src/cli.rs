/// 命令行参数定义
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "buggy")]
#[command(author, version, about = "TLS tunnel pair relaying TCP over HTTP CONNECT", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志详细程度 (-v info, -vv debug, -vvv trace)；未指定时读取 RUST_LOG
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行服务端（TLS 接入，CONNECT 隧道到目标）
    Server {
        /// 配置文件路径（可选，缺省时只使用默认值和环境变量）
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// 运行客户端（明文接入，通过 TLS 连接服务端）
    Client {
        /// 配置文件路径（可选，缺省时只使用默认值和环境变量）
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: PathBuf,
    },
    /// 生成自签名证书
    Cert {
        /// 证书输出路径
        #[arg(long, value_name = "PATH", default_value = "server.pem")]
        cert_out: PathBuf,

        /// 私钥输出路径
        #[arg(long, value_name = "PATH", default_value = "server.key")]
        key_out: PathBuf,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
}
