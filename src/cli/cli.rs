use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stack Guardian - 进程守护与启动编排
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CommandArgs {
    /// 配置文件路径
    #[arg(short, long, env = "GUARDIAN_CONFIG", default_value = "guardian.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 等待外部进程就绪后启动托管进程，并持续守护
    Up,
    /// 停止正在运行的 guardian 及其托管进程
    Down,
    /// 只启动并守护托管进程
    Start,
    /// 停止托管进程（通过正在运行的 guardian）
    Stop,
    /// 重启托管进程，不带 id 时重启全部
    Restart {
        /// 进程 id
        id: Option<String>,
    },
    /// 查看托管进程的输出日志
    Logs {
        /// 进程 id，只有一个配置了 log_file 的进程时可省略
        id: Option<String>,
        /// 持续输出新内容
        #[arg(short, long)]
        follow: bool,
        /// 先输出的末尾行数
        #[arg(short = 'n', long = "lines", default_value_t = 50)]
        lines: usize,
    },
    /// 查看进程状态
    Status {
        /// 输出 JSON
        #[arg(long)]
        json: bool,
    },
}
