mod commands;
mod control;
mod logging;

use clap::{Parser, Subcommand};
use commands::Session;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "uverse")]
#[command(about = "Uverse のローカルサービス（DB・ストレージ・バックエンド）を起動・監視する", long_about = None)]
struct Cli {
    /// 相対パスの基準ディレクトリ（省略時はパッケージ版なら実行ファイルの場所、開発版ならカレントディレクトリ）
    #[arg(long, global = true, env = "UVERSE_BASE_DIR")]
    base_dir: Option<PathBuf>,
    /// 使用する設定ファイル（.env）
    #[arg(long, global = true, env = "UVERSE_CONFIG")]
    config: Option<PathBuf>,
    /// パッケージ版として動作する
    #[arg(long, global = true, env = "UVERSE_PACKAGED")]
    packaged: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// サービスを起動して監視する（Ctrl-C で停止）
    Run {
        /// コントロール API の待ち受けポート
        #[arg(long, env = "UVERSE_CONTROL_PORT", default_value_t = control::DEFAULT_CONTROL_PORT)]
        control_port: u16,
        /// UI から起動要求があるまでサービスを起動しない
        #[arg(long)]
        no_autostart: bool,
    },
    /// 必須パスを検証する（mineru.json も必要なら修復）
    Check,
    /// 設定の表示・変更
    #[command(subcommand)]
    Config(ConfigCommands),
    /// バージョン情報を表示
    Version,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// 設定一覧を表示
    Show {
        /// JSON で出力
        #[arg(long)]
        json: bool,
    },
    /// 設定を変更（KEY=VALUE を複数指定可）
    Set {
        #[arg(required = true, value_name = "KEY=VALUE")]
        pairs: Vec<String>,
    },
    /// 使用中の設定ファイルのパスを表示
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let session = || Session::from_args(cli.base_dir.clone(), cli.config.clone(), cli.packaged);

    match cli.command {
        // Versionコマンドは設定ファイル不要
        Commands::Version => {
            println!("uverse {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Run {
            control_port,
            no_autostart,
        } => {
            let session = session()?;
            let log = logging::init_supervisor(&session)?;
            commands::run::handle(session, log, control_port, !no_autostart).await?;
        }
        Commands::Check => {
            logging::init_cli();
            if !commands::check::handle(&session()?)? {
                std::process::exit(1);
            }
        }
        Commands::Config(config_cmd) => {
            logging::init_cli();
            let session = session()?;
            match config_cmd {
                ConfigCommands::Show { json } => commands::config::handle_show(&session, json)?,
                ConfigCommands::Set { pairs } => {
                    if !commands::config::handle_set(&session, &pairs)? {
                        std::process::exit(1);
                    }
                }
                ConfigCommands::Path => {
                    println!("{}", session.store.path().display());
                }
            }
        }
    }

    Ok(())
}
