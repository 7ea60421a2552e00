use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use quill_llm::{SCRIPTED_SOURCE_ID, SourceError};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

use crate::chat::{
    MessageId, MessageStatus, Role, SessionController, SessionUpdate, SubmitOutcome,
    SubmitRejection,
};
use crate::settings::SettingsStore;

const ASSISTANT_PREFIX: &str = "assistant> ";
const TYPING_MARKER: &str = "assistant is typing...";
/// Carriage return plus erase-line, so the open line can be rewritten in place.
const CLEAR_LINE: &str = "\r\x1b[2K";

/// Streams assistant replies into the terminal.
#[derive(Debug, Parser)]
#[command(name = "quill", version, about)]
pub struct Cli {
    /// Answer with a local echo instead of calling a backend.
    #[arg(long)]
    pub offline: bool,
    /// Settings file to use instead of the per-user one.
    #[arg(long, value_name = "PATH", env = "QUILL_CONFIG")]
    pub config: Option<PathBuf>,
    /// Log debug output to stderr.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to create assistant source on `{stage}`: {source}"))]
    CreateSource {
        stage: &'static str,
        source: SourceError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Submit(String),
    /// 1-based index of a suggestion under the latest reply.
    Choose(usize),
    /// 1-based index of a starter prompt.
    Try(usize),
    Stop,
    Quit,
    Empty,
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    match line {
        "" => Command::Empty,
        "/stop" => Command::Stop,
        "/quit" | "/exit" => Command::Quit,
        _ if line == "/try" || line.starts_with("/try ") => {
            Command::Try(line["/try".len()..].trim().parse().unwrap_or(0))
        }
        _ => match line.parse::<usize>() {
            Ok(index) if index > 0 => Command::Choose(index),
            _ => Command::Submit(line.to_string()),
        },
    }
}

pub async fn run(cli: Cli) -> Result<(), AppError> {
    let store = match cli.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    let mut settings = store.settings().as_ref().clone().with_env_overrides();
    if cli.offline {
        settings.source_kind = SCRIPTED_SOURCE_ID.to_string();
    }

    let source = quill_llm::create_source(settings.to_source_config()).context(CreateSourceSnafu {
        stage: "create-source-from-settings",
    })?;
    tracing::info!(source = source.id(), model = %settings.model, "starting session");

    let (mut controller, updates) = SessionController::new(source, settings.session_options());
    if let Some(greeting) = settings.greeting.clone() {
        controller.greet(greeting.text, greeting.suggestions);
    }

    let mut app = TerminalApp::new(controller, updates, std::io::stdout())
        .with_starter_prompts(settings.starter_prompts.clone());
    app.run(tokio::io::BufReader::new(tokio::io::stdin())).await
}

/// Prints each reveal as it advances and reads commands between ticks.
pub struct TerminalApp<W> {
    controller: SessionController,
    updates: mpsc::UnboundedReceiver<SessionUpdate>,
    out: W,
    printed: BTreeMap<MessageId, String>,
    open_line: Option<MessageId>,
    /// Reply whose open line currently holds the typing marker.
    typing: Option<MessageId>,
    starter_prompts: Vec<String>,
}

impl<W: Write> TerminalApp<W> {
    pub fn new(
        controller: SessionController,
        updates: mpsc::UnboundedReceiver<SessionUpdate>,
        out: W,
    ) -> Self {
        Self {
            controller,
            updates,
            out,
            printed: BTreeMap::new(),
            open_line: None,
            typing: None,
            starter_prompts: Vec::new(),
        }
    }

    /// Prompts listed at startup and selectable with `/try N`.
    pub fn with_starter_prompts(mut self, prompts: Vec<String>) -> Self {
        self.starter_prompts = prompts;
        self
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    /// Runs until `/quit`, or until input ends and the last reveal finished.
    pub async fn run<R>(&mut self, input: R) -> Result<(), AppError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut input_open = true;
        self.flush_updates()?;
        self.list_starter_prompts()?;

        loop {
            let busy = self.controller.is_busy();
            if !busy && !input_open {
                break;
            }

            tokio::select! {
                line = lines.next_line(), if input_open => {
                    match line.context(ReadInputSnafu { stage: "read-input-line" })? {
                        Some(line) => {
                            if !self.on_line(&line)? {
                                break;
                            }
                        }
                        None => input_open = false,
                    }
                }
                Some(wakeup) = self.controller.next_wakeup(), if busy => {
                    self.controller.handle(wakeup);
                }
                else => break,
            }

            self.flush_updates()?;
        }

        self.flush_updates()
    }

    /// Returns false when the session should end.
    fn on_line(&mut self, line: &str) -> Result<bool, AppError> {
        match parse_command(line) {
            Command::Empty => {}
            Command::Quit => {
                self.controller.shutdown();
                return Ok(false);
            }
            Command::Stop => {
                if !self.controller.cancel() {
                    self.note("nothing to stop")?;
                }
            }
            Command::Choose(index) => {
                let latest = self
                    .controller
                    .conversation()
                    .iter()
                    .rev()
                    .find(|message| message.role == Role::Assistant)
                    .map(|message| message.id);
                let outcome = match latest {
                    Some(message_id) => self.controller.choose_suggestion(message_id, index - 1),
                    None => SubmitOutcome::Rejected(SubmitRejection::UnknownMessage),
                };
                self.report(outcome)?;
            }
            Command::Try(index) => {
                match index
                    .checked_sub(1)
                    .and_then(|index| self.starter_prompts.get(index))
                {
                    Some(prompt) => {
                        let outcome = self.controller.submit(prompt.clone());
                        self.report(outcome)?;
                    }
                    None => self.note("no such starter prompt")?,
                }
            }
            Command::Submit(text) => {
                let outcome = self.controller.submit(text);
                self.report(outcome)?;
            }
        }
        Ok(true)
    }

    fn list_starter_prompts(&mut self) -> Result<(), AppError> {
        if self.starter_prompts.is_empty() {
            return Ok(());
        }
        writeln!(self.out, "Try asking:").context(WriteOutputSnafu {
            stage: "write-starter-heading",
        })?;
        for (index, prompt) in self.starter_prompts.iter().enumerate() {
            writeln!(self.out, "  /try {}  {prompt}", index + 1).context(WriteOutputSnafu {
                stage: "write-starter-prompt",
            })?;
        }
        Ok(())
    }

    fn report(&mut self, outcome: SubmitOutcome) -> Result<(), AppError> {
        match outcome {
            SubmitOutcome::Accepted { .. } | SubmitOutcome::Rejected(SubmitRejection::EmptyText) => {
                Ok(())
            }
            SubmitOutcome::Rejected(SubmitRejection::InFlight { .. }) => {
                self.note("still answering, type /stop to cancel")
            }
            SubmitOutcome::Rejected(
                SubmitRejection::SuggestionHidden
                | SubmitRejection::UnknownSuggestion
                | SubmitRejection::UnknownMessage,
            ) => self.note("no such suggestion"),
            SubmitOutcome::Rejected(SubmitRejection::Conversation(rejection)) => {
                tracing::warn!(?rejection, "submission rejected");
                self.note("could not send that")
            }
        }
    }

    fn flush_updates(&mut self) -> Result<(), AppError> {
        while let Ok(update) = self.updates.try_recv() {
            self.render(update)?;
        }
        self.out
            .flush()
            .context(WriteOutputSnafu { stage: "flush-output" })
    }

    fn render(&mut self, update: SessionUpdate) -> Result<(), AppError> {
        match update {
            SessionUpdate::MessageAppended(message) if message.role == Role::Assistant => {
                if message.status == MessageStatus::InFlight {
                    self.show_typing(message.id)?;
                }
                self.show_progress(message.id)?;
                if message.status == MessageStatus::Finalized {
                    self.finish(message.id)?;
                }
                Ok(())
            }
            SessionUpdate::MessageAppended(_) => Ok(()),
            SessionUpdate::MessageUpdated(message) if message.status == MessageStatus::Failed => {
                self.show_progress(message.id)
            }
            SessionUpdate::MessageUpdated(_) => Ok(()),
            SessionUpdate::RevealAdvanced { message_id, .. } => self.show_progress(message_id),
            SessionUpdate::RevealCompleted(message_id) => {
                self.show_progress(message_id)?;
                self.finish(message_id)
            }
        }
    }

    /// Writes whatever part of the message became visible since the last call.
    fn show_progress(&mut self, message_id: MessageId) -> Result<(), AppError> {
        let Some(view) = self.controller.view(message_id) else {
            return Ok(());
        };
        let printed = self.printed.get(&message_id).cloned().unwrap_or_default();
        if view.text_to_display == printed {
            return Ok(());
        }

        let restart = !view.text_to_display.starts_with(printed.as_str());
        let fresh = if restart {
            view.text_to_display.as_str()
        } else {
            &view.text_to_display[printed.len()..]
        };

        let owns_line = self.open_line == Some(message_id);
        let typing = self.typing == Some(message_id);
        if restart || typing || !owns_line {
            if owns_line {
                // Failure text and the typing marker replace the line in place.
                write!(self.out, "{CLEAR_LINE}").context(WriteOutputSnafu {
                    stage: "clear-line",
                })?;
            } else if self.open_line.is_some() {
                self.end_line()?;
            }
            write!(self.out, "{ASSISTANT_PREFIX}").context(WriteOutputSnafu {
                stage: "write-prefix",
            })?;
            if !restart && !printed.is_empty() {
                write!(self.out, "{printed}").context(WriteOutputSnafu {
                    stage: "write-resumed-text",
                })?;
            }
            self.open_line = Some(message_id);
            self.typing = None;
        }

        write!(self.out, "{fresh}").context(WriteOutputSnafu {
            stage: "write-revealed-text",
        })?;
        self.printed.insert(message_id, view.text_to_display);
        Ok(())
    }

    /// Shows the typing marker while the reply has nothing to reveal yet.
    fn show_typing(&mut self, message_id: MessageId) -> Result<(), AppError> {
        let waiting = self.controller.conversation().has_in_flight()
            && self
                .controller
                .view(message_id)
                .is_some_and(|view| view.text_to_display.is_empty());
        if !waiting || self.open_line.is_some() {
            return Ok(());
        }
        write!(self.out, "{TYPING_MARKER}").context(WriteOutputSnafu {
            stage: "write-typing-marker",
        })?;
        self.open_line = Some(message_id);
        self.typing = Some(message_id);
        Ok(())
    }

    fn finish(&mut self, message_id: MessageId) -> Result<(), AppError> {
        if self.open_line == Some(message_id) {
            self.end_line()?;
        }

        let Some(view) = self.controller.view(message_id) else {
            return Ok(());
        };
        for (index, suggestion) in view.visible_suggestions().iter().enumerate() {
            writeln!(self.out, "  [{}] {suggestion}", index + 1).context(WriteOutputSnafu {
                stage: "write-suggestion",
            })?;
        }
        Ok(())
    }

    fn note(&mut self, text: &str) -> Result<(), AppError> {
        self.end_line()?;
        writeln!(self.out, "({text})").context(WriteOutputSnafu { stage: "write-note" })
    }

    /// Closes the open line. A line that only holds the typing marker is erased.
    fn end_line(&mut self) -> Result<(), AppError> {
        if self.open_line.take().is_none() {
            return Ok(());
        }
        if self.typing.take().is_some() {
            write!(self.out, "{CLEAR_LINE}").context(WriteOutputSnafu {
                stage: "clear-typing-marker",
            })
        } else {
            writeln!(self.out).context(WriteOutputSnafu { stage: "end-line" })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quill_llm::{Script, ScriptedSource};

    use super::*;
    use crate::chat::SessionOptions;

    fn app(scripts: Vec<Script>) -> TerminalApp<Vec<u8>> {
        let options = SessionOptions {
            reveal_seed: Some(5),
            ..SessionOptions::default()
        };
        let (controller, updates) =
            SessionController::new(Arc::new(ScriptedSource::new(scripts)), options);
        TerminalApp::new(controller, updates, Vec::new())
    }

    fn printed(app: &TerminalApp<Vec<u8>>) -> String {
        String::from_utf8_lossy(app.output()).into_owned()
    }

    /// What a terminal would leave on screen once every line rewrite is applied.
    fn visible_lines(output: &str) -> Vec<&str> {
        output
            .lines()
            .map(|line| line.rsplit(CLEAR_LINE).next().unwrap_or(line))
            .filter(|line| !line.is_empty())
            .collect()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("  "), Command::Empty);
        assert_eq!(parse_command("/stop"), Command::Stop);
        assert_eq!(parse_command("/quit"), Command::Quit);
        assert_eq!(parse_command(" 2 "), Command::Choose(2));
        assert_eq!(parse_command("0"), Command::Submit("0".to_string()));
        assert_eq!(parse_command("/try 3"), Command::Try(3));
        assert_eq!(parse_command("/try"), Command::Try(0));
        assert_eq!(parse_command("/try x"), Command::Try(0));
        assert_eq!(
            parse_command("/trying"),
            Command::Submit("/trying".to_string())
        );
        assert_eq!(
            parse_command(" Hello there "),
            Command::Submit("Hello there".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn prints_reply_then_suggestions() {
        let mut app = app(vec![Script::completing(["Hi", " there"])]);

        app.run(&b"Hello\n"[..]).await.unwrap();

        let output = printed(&app);
        assert!(
            output.starts_with("assistant is typing...\r\x1b[2Kassistant> Hi there\n"),
            "{output:?}"
        );
        assert!(output.contains("  [1] Tell me more\n"), "{output}");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_rewrites_the_partial_line() {
        let mut app = app(vec![
            Script::failing(["Partial text here"], "connection reset")
                .with_fragment_delay(std::time::Duration::from_millis(200)),
        ]);

        app.run(&b"Hello\n"[..]).await.unwrap();

        let output = printed(&app);
        assert!(output.contains("assistant> P"), "{output:?}");
        assert_eq!(
            visible_lines(&output),
            vec!["assistant> Error: connection reset"],
            "{output:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn starter_prompts_are_listed_and_submitted() {
        let mut app = app(vec![Script::completing(["Plenty"])]).with_starter_prompts(vec![
            "How can you help me today?".to_string(),
            "What can you do?".to_string(),
        ]);

        app.run(&b"/try 2\n/try 9\n"[..]).await.unwrap();

        let output = printed(&app);
        assert!(
            output.starts_with(
                "Try asking:\n  /try 1  How can you help me today?\n  /try 2  What can you do?\n"
            ),
            "{output}"
        );
        assert!(output.contains("(no such starter prompt)\n"), "{output}");

        let user_turns = app
            .controller()
            .conversation()
            .iter()
            .filter(|message| message.role == Role::User)
            .map(|message| message.text.clone())
            .collect::<Vec<_>>();
        assert_eq!(user_turns, vec!["What can you do?".to_string()]);
        assert!(visible_lines(&output).contains(&"assistant> Plenty"), "{output:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn typing_marker_is_erased_for_an_empty_reply() {
        let mut app = app(vec![Script::completing(Vec::<String>::new())]);

        app.run(&b"Hello\n"[..]).await.unwrap();

        let output = printed(&app);
        assert!(output.starts_with(TYPING_MARKER), "{output:?}");
        assert!(
            !visible_lines(&output).contains(&TYPING_MARKER),
            "{output:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reply_is_printed_in_full() {
        let mut app = app(vec![Script::failing(["Par"], "connection reset")]);

        app.run(&b"Hello\n"[..]).await.unwrap();

        let output = printed(&app);
        assert!(output.contains("assistant> Error: connection reset\n"), "{output}");
        assert!(!output.contains("[1]"), "{output}");
    }

    #[tokio::test(start_paused = true)]
    async fn quit_tears_down_the_session() {
        let mut app = app(vec![Script::completing(["slow"])
            .with_fragment_delay(std::time::Duration::from_secs(60))]);

        app.run(&b"Hello\n/quit\n"[..]).await.unwrap();

        assert!(!app.controller().is_busy());
        let output = printed(&app);
        assert!(output.contains("Response cancelled."), "{output}");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_reply_prints_a_note() {
        let mut app = app(Vec::new());
        app.run(&b"/stop\n"[..]).await.unwrap();
        assert_eq!(printed(&app), "(nothing to stop)\n");
    }
}
