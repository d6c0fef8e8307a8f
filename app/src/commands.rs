/// One line of REPL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Say(String),
    List,
    Open(i64),
    New,
    Rename { id: i64, title: String },
    Delete(i64),
    Help,
    Quit,
    Empty,
}

pub const HELP: &str = "\
Type a message to send it. Ctrl-C cancels a reply in progress.
  /list               list conversations
  /open ID            open a conversation
  /new                start a new conversation
  /rename ID TITLE    rename a conversation
  /delete ID          delete a conversation
  /help               show this help
  /quit               exit";

impl ReplCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Say(line.to_string()));
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        match name {
            "list" | "ls" => Ok(Self::List),
            "open" => parse_id(args).map(Self::Open),
            "new" => Ok(Self::New),
            "rename" => {
                let (id, title) = args
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| "usage: /rename ID TITLE".to_string())?;
                Ok(Self::Rename {
                    id: parse_id(id)?,
                    title: title.trim().to_string(),
                })
            }
            "delete" | "rm" => parse_id(args).map(Self::Delete),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            other => Err(format!("unknown command /{other}, try /help")),
        }
    }
}

fn parse_id(raw: &str) -> Result<i64, String> {
    raw.trim()
        .parse()
        .map_err(|_| format!("expected a conversation id, got {raw:?}"))
}
