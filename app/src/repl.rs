use crate::commands::{ReplCommand, HELP};
use anyhow::Result;
use parlor_core::{
    ChatSession, ClientError, Message, MessageRole, Navigation, SendOutcome, SessionEvent,
};
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

/// Line-oriented chat loop over one [`ChatSession`].
pub struct Repl<W> {
    session: ChatSession,
    events: UnboundedReceiver<SessionEvent>,
    navigation: UnboundedReceiver<Navigation>,
    out: W,
}

impl<W: Write> Repl<W> {
    pub fn new(
        session: ChatSession,
        events: UnboundedReceiver<SessionEvent>,
        navigation: UnboundedReceiver<Navigation>,
        out: W,
    ) -> Self {
        Self {
            session,
            events,
            navigation,
            out,
        }
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Read commands until `/quit`, end of input, or Ctrl-C at the prompt.
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> Result<()> {
        let mut lines = input.lines();
        loop {
            self.prompt()?;
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                writeln!(self.out)?;
                break;
            };
            match ReplCommand::parse(&line) {
                Ok(ReplCommand::Quit) => break,
                Ok(command) => {
                    if let Err(err) = self.execute(command).await {
                        let message = match err.downcast_ref::<ClientError>() {
                            Some(client_error) => client_error.user_message(),
                            None => err.to_string(),
                        };
                        writeln!(self.out, "error: {message}")?;
                    }
                }
                Err(usage) => writeln!(self.out, "{usage}")?,
            }
            self.report_navigation()?;
        }
        Ok(())
    }

    pub async fn execute(&mut self, command: ReplCommand) -> Result<()> {
        match command {
            ReplCommand::Say(text) => self.say(&text).await?,
            ReplCommand::List => self.list().await?,
            ReplCommand::Open(id) => {
                self.session.open(id).await?;
                self.print_transcript()?;
            }
            ReplCommand::New => {
                if self.session.new_conversation() {
                    writeln!(self.out, "started a new conversation")?;
                }
            }
            ReplCommand::Rename { id, title } => {
                self.session.rename(id, &title).await?;
                writeln!(self.out, "renamed #{id}")?;
            }
            ReplCommand::Delete(id) => {
                self.session.delete(id).await?;
                writeln!(self.out, "deleted #{id}")?;
            }
            ReplCommand::Help => writeln!(self.out, "{HELP}")?,
            ReplCommand::Quit | ReplCommand::Empty => {}
        }
        self.drain_events()
    }

    async fn say(&mut self, text: &str) -> Result<()> {
        let session = self.session.clone();
        let send = session.send(text, None);
        tokio::pin!(send);
        let outcome = loop {
            tokio::select! {
                outcome = &mut send => break outcome,
                Some(event) = self.events.recv() => self.render(event)?,
                _ = tokio::signal::ctrl_c() => {
                    self.session.cancel();
                }
            }
        };
        self.drain_events()?;
        if let SendOutcome::Rejected = outcome {
            writeln!(self.out, "nothing sent")?;
        }
        Ok(())
    }

    async fn list(&mut self) -> Result<()> {
        let data = self.session.api().chat_data(None).await?;
        if data.conversations.is_empty() {
            writeln!(self.out, "no conversations yet")?;
        }
        let current = self.session.conversation_id();
        for conversation in &data.conversations {
            let marker = if Some(conversation.id) == current { '*' } else { ' ' };
            writeln!(
                self.out,
                "{marker}{:>5}  {}  {}",
                conversation.id,
                conversation.updated_at.format("%Y-%m-%d %H:%M"),
                conversation.title
            )?;
        }
        Ok(())
    }

    fn print_transcript(&mut self) -> Result<()> {
        let transcript = self.session.transcript();
        if transcript.is_empty() {
            writeln!(self.out, "(no messages)")?;
        }
        for message in &transcript {
            self.print_message(message)?;
        }
        Ok(())
    }

    fn print_message(&mut self, message: &Message) -> Result<()> {
        let speaker = match message.role {
            MessageRole::User => "you",
            MessageRole::Assistant => "assistant",
        };
        writeln!(self.out, "{speaker}: {}", message.content)?;
        Ok(())
    }

    fn render(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Delta(delta) => {
                write!(self.out, "{delta}")?;
                self.out.flush()?;
            }
            SessionEvent::Completed(_) => writeln!(self.out)?,
            SessionEvent::Failed(message) => writeln!(self.out, "\n[error] {message}")?,
            SessionEvent::Cancelled => writeln!(self.out, "\n[cancelled]")?,
            SessionEvent::SelectionCleared => writeln!(self.out, "conversation closed")?,
            other => debug!(event = ?other, "session event"),
        }
        Ok(())
    }

    fn drain_events(&mut self) -> Result<()> {
        while let Ok(event) = self.events.try_recv() {
            self.render(event)?;
        }
        Ok(())
    }

    fn report_navigation(&mut self) -> Result<()> {
        while let Ok(Navigation::Login { redirect, .. }) = self.navigation.try_recv() {
            writeln!(
                self.out,
                "Your session has expired (at {redirect}). Restart with --email to sign in again."
            )?;
        }
        Ok(())
    }

    fn prompt(&mut self) -> Result<()> {
        match self.session.conversation_id() {
            Some(id) => write!(self.out, "[#{id}]> ")?,
            None => write!(self.out, "> ")?,
        }
        self.out.flush()?;
        Ok(())
    }
}
