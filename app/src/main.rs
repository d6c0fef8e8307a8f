use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use parlor::commands::HELP;
use parlor::{Repl, ReplCommand};
use parlor_core::{telemetry, ApiClient, ChatSession, ClientSettings, Credentials};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;
use tracing::info;

const PASSWORD_ENV: &str = "PARLOR_PASSWORD";

#[derive(Parser, Debug)]
#[command(name = "parlor", version, about = "Terminal client for a Parlor chat server")]
struct Cli {
    /// Server URL; overrides parlor.yaml and PARLOR_BASE_URL.
    #[arg(long, global = true)]
    base_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show whether the server can answer chats and who is signed in.
    Check,
    /// Interactive chat.
    Chat {
        #[arg(long)]
        conversation: Option<i64>,
        /// Sign in first; the password comes from PARLOR_PASSWORD or stdin.
        #[arg(long)]
        email: Option<String>,
    },
    /// Print the onload payload of a page as JSON.
    Page { name: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = ClientSettings::load_with_base_url(cli.base_url.as_deref())
        .map_err(|err| anyhow!(err.user_message()))?;
    telemetry::init_tracing(telemetry::filter_from_env_or(&settings.log_level))?;

    let runtime = Runtime::new()?;
    runtime.block_on(run(cli.command, settings))
}

async fn run(command: Command, settings: ClientSettings) -> anyhow::Result<()> {
    let (api, navigation) = ApiClient::connect(&settings)?;
    info!(base_url = %settings.base_url, "connected");

    match command {
        Command::Check => {
            let config = api.chat_config().await?;
            println!(
                "chat: {}",
                if config.openai_configured {
                    "available"
                } else {
                    "not configured on the server"
                }
            );
            match api.current_user().await {
                Ok(user) => println!("signed in as {} (roles: {})", user.email, user.roles.join(", ")),
                Err(err) => println!("not signed in: {}", err.user_message()),
            }
        }
        Command::Page { name } => {
            api.transport().set_location(format!("/{}", name.trim_matches('/')));
            let page: serde_json::Value = api
                .page_data(&name)
                .await
                .map_err(|err| anyhow!(err.user_message()))?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Command::Chat {
            conversation,
            email,
        } => {
            let mut stdin = BufReader::new(tokio::io::stdin());
            if let Some(email) = email {
                let password = read_password(&mut stdin).await?;
                let user = api
                    .login(&Credentials::new(email, password))
                    .await
                    .map_err(|err| anyhow!(err.user_message()))?;
                println!("signed in as {}", user.email);
            }
            api.transport().set_location("/chat");

            let (session, events) = ChatSession::new(api, &settings);
            let mut repl = Repl::new(session, events, navigation, std::io::stdout());
            println!("{HELP}");
            if let Some(id) = conversation {
                repl.execute(ReplCommand::Open(id))
                    .await
                    .map_err(|err| anyhow!("failed to open conversation #{id}: {err}"))?;
            }
            repl.run(stdin).await?;
        }
    }
    Ok(())
}

async fn read_password<R: tokio::io::AsyncBufRead + Unpin>(input: &mut R) -> anyhow::Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    eprint!("password: ");
    let mut line = String::new();
    input
        .read_line(&mut line)
        .await
        .context("failed to read password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
