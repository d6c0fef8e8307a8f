use anyhow::{bail, ensure, Result};
use clap::{Parser, Subcommand};
use parlor_core::transport::REFRESH_PATH;
use parlor_core::{
    telemetry, ApiClient, ChatSession, ClientSettings, MockExchange, MockReply, SendOutcome,
};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Parlor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a chat round trip against the scripted backend, including a session refresh.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    runtime.block_on(chat_round_trip())
}

async fn chat_round_trip() -> Result<()> {
    let mock = MockExchange::new();
    mock.on_post("/api/chat/send", MockReply::status(401))
        .on_post(REFRESH_PATH, MockReply::status(200))
        .on_post(
            "/api/chat/send",
            MockReply::event_stream([
                "data: {\"content\":\"Hi\"}\n\n",
                "data: {\"content\":\" there\"}\n\n",
                "data: {\"done\":true}\n\n",
            ])
            .header("X-Conversation-Id", "42"),
        );

    let settings = ClientSettings::for_base_url("http://smoke.parlor.invalid")?;
    let (api, _navigation) = ApiClient::with_exchange(Arc::new(mock.clone()), &settings);
    let (session, _events) = ChatSession::new(api, &settings);

    let reply = match session.send("Hello", None).await {
        SendOutcome::Completed { reply, .. } => reply,
        other => bail!("smoke send did not complete: {other:?}"),
    };
    ensure!(reply.content == "Hi there", "unexpected reply {:?}", reply.content);
    ensure!(session.conversation_id() == Some(42), "conversation id not adopted");
    let transcript = session.transcript();
    ensure!(
        transcript.len() == 2 && transcript.iter().all(|m| !m.id.is_provisional()),
        "unexpected transcript {transcript:?}"
    );
    ensure!(mock.call_count(REFRESH_PATH) == 1, "expected exactly one refresh");
    let body = mock.last_call("/api/chat/send").and_then(|call| call.body);
    ensure!(
        body == Some(json!({"message": "Hello"})),
        "unexpected send body {body:?}"
    );

    info!(
        "messages" = transcript.len(),
        "conversation_id" = 42,
        "smoke test chat round trip succeeded"
    );
    Ok(())
}
