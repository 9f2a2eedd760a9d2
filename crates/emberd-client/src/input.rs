//! Keyboard input handler.
//!
//! Runs as its own task owning the raw-mode read side of the terminal.
//! In its normal state it maps the handful of interactive keystrokes onto
//! `KeyboardInput` messages for the render loop; when the render loop
//! hands over a [`InputRequest`] it switches into a modal read (prompt
//! line or raw project input) and answers the daemon directly.
//!
//! Ctrl-C enqueues `CancelBuild` both toward the daemon and onto the
//! render queue, so the blocked render loop wakes and terminates without
//! any platform interrupt machinery. The handler is inert on dumb
//! terminals.

use std::io::Write;

use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use emberd_proto::Message;
use futures::StreamExt;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::output::InputRequest;

/// What a keystroke means in the non-modal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyAction {
    /// Wrap as `KeyboardInput` for the render loop.
    Forward(char),
    /// Cancel the build.
    Cancel,
    /// Not an interactive key.
    Ignore,
}

/// Classify a key event in the non-modal state.
fn classify(event: &KeyEvent) -> KeyAction {
    if event.kind != KeyEventKind::Press {
        return KeyAction::Ignore;
    }
    let ctrl = event.modifiers.contains(KeyModifiers::CONTROL);
    match event.code {
        KeyCode::Char('c') if ctrl => KeyAction::Cancel,
        KeyCode::Char('b') if ctrl => KeyAction::Forward('\u{2}'),
        KeyCode::Char('l') if ctrl => KeyAction::Forward('\u{c}'),
        KeyCode::Char('m') if ctrl => KeyAction::Forward('\u{d}'),
        KeyCode::Enter => KeyAction::Forward('\u{d}'),
        KeyCode::Char(c @ ('+' | '-')) if !ctrl => KeyAction::Forward(c),
        _ => KeyAction::Ignore,
    }
}

/// Result of feeding one key to a modal line read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditStep {
    /// Keep reading; echo the char when `Some`.
    Pending(Option<char>),
    /// Erase one echoed char.
    Erase,
    /// The line is complete.
    Done,
    /// The user canceled (Ctrl-C / Ctrl-D).
    Canceled,
}

/// Line editor state for modal prompt reads.
#[derive(Debug, Default)]
struct LineEditor {
    buffer: String,
    mask: bool,
}

impl LineEditor {
    fn new(mask: bool) -> Self {
        Self { buffer: String::new(), mask }
    }

    fn feed(&mut self, event: &KeyEvent) -> EditStep {
        if event.kind != KeyEventKind::Press {
            return EditStep::Pending(None);
        }
        let ctrl = event.modifiers.contains(KeyModifiers::CONTROL);
        match event.code {
            KeyCode::Char('c' | 'd') if ctrl => EditStep::Canceled,
            KeyCode::Enter => EditStep::Done,
            KeyCode::Backspace => {
                if self.buffer.pop().is_some() {
                    EditStep::Erase
                } else {
                    EditStep::Pending(None)
                }
            },
            KeyCode::Char(c) if !ctrl => {
                self.buffer.push(c);
                EditStep::Pending(Some(if self.mask { '*' } else { c }))
            },
            _ => EditStep::Pending(None),
        }
    }

    fn into_line(self) -> String {
        self.buffer
    }
}

/// Spawn the input handler task.
///
/// `render_queue` receives `KeyboardInput`/`CancelBuild` for the render
/// loop; `daemon_dispatch` receives `CancelBuild`, `PromptResponse` and
/// `InputData` bound for the daemon. A dumb terminal spawns an inert
/// task.
pub fn spawn(
    requests: mpsc::UnboundedReceiver<InputRequest>,
    render_queue: mpsc::UnboundedSender<Message>,
    daemon_dispatch: mpsc::UnboundedSender<Message>,
    dumb: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if dumb {
            return;
        }
        run(requests, render_queue, daemon_dispatch).await;
    })
}

async fn run(
    mut requests: mpsc::UnboundedReceiver<InputRequest>,
    render_queue: mpsc::UnboundedSender<Message>,
    daemon_dispatch: mpsc::UnboundedSender<Message>,
) {
    let mut events = EventStream::new();

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(InputRequest::Prompt { project_id, uid, message, password }) => {
                    modal_prompt(&mut events, &daemon_dispatch, &render_queue, &project_id, &uid, &message, password)
                        .await;
                },
                Some(InputRequest::ProjectInput { project_id: _, bytes_to_read }) => {
                    modal_project_input(&mut events, &daemon_dispatch, &render_queue, bytes_to_read)
                        .await;
                },
                None => return,
            },
            event = events.next() => match event {
                Some(Ok(Event::Key(key))) => match classify(&key) {
                    KeyAction::Forward(c) => {
                        if render_queue.send(Message::keyboard_input(c)).is_err() {
                            return;
                        }
                    },
                    KeyAction::Cancel => {
                        cancel(&daemon_dispatch, &render_queue);
                    },
                    KeyAction::Ignore => {},
                },
                Some(Ok(_)) => {},
                Some(Err(error)) => {
                    tracing::warn!(%error, "terminal event stream failed");
                    return;
                },
                None => return,
            },
        }
    }
}

fn cancel(
    daemon_dispatch: &mpsc::UnboundedSender<Message>,
    render_queue: &mpsc::UnboundedSender<Message>,
) {
    let _ = daemon_dispatch.send(Message::CancelBuild);
    let _ = render_queue.send(Message::CancelBuild);
}

fn echo(text: &str) {
    let mut err = std::io::stderr();
    let _ = err.write_all(text.as_bytes());
    let _ = err.flush();
}

/// Present a prompt, read one line (masked when `password`) and answer
/// with a `PromptResponse`.
async fn modal_prompt(
    events: &mut EventStream,
    daemon_dispatch: &mpsc::UnboundedSender<Message>,
    render_queue: &mpsc::UnboundedSender<Message>,
    project_id: &str,
    uid: &str,
    message: &str,
    password: bool,
) {
    echo(message);
    let mut editor = LineEditor::new(password);

    while let Some(event) = events.next().await {
        let Ok(Event::Key(key)) = event else { continue };
        match editor.feed(&key) {
            EditStep::Pending(Some(c)) => {
                let mut tmp = [0u8; 4];
                echo(c.encode_utf8(&mut tmp));
            },
            EditStep::Pending(None) => {},
            EditStep::Erase => echo("\u{8} \u{8}"),
            EditStep::Done => {
                echo("\r\n");
                let reply = Message::prompt_response(project_id, uid, editor.into_line());
                let _ = daemon_dispatch.send(reply);
                return;
            },
            EditStep::Canceled => {
                echo("\r\n");
                cancel(daemon_dispatch, render_queue);
                return;
            },
        }
    }
}

/// Read up to `bytes_to_read` bytes of keyboard input and stream them as
/// `InputData` chunks terminated by the EOF marker.
async fn modal_project_input(
    events: &mut EventStream,
    daemon_dispatch: &mpsc::UnboundedSender<Message>,
    render_queue: &mpsc::UnboundedSender<Message>,
    bytes_to_read: i32,
) {
    let limit = usize::try_from(bytes_to_read).unwrap_or(0);
    let mut data = String::new();

    while data.len() < limit {
        let Some(event) = events.next().await else { break };
        let Ok(Event::Key(key)) = event else { continue };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c') if ctrl => {
                cancel(daemon_dispatch, render_queue);
                return;
            },
            // Ctrl-D closes the stream early
            KeyCode::Char('d') if ctrl => break,
            KeyCode::Enter => {
                data.push('\n');
                echo("\r\n");
                break;
            },
            KeyCode::Char(c) if !ctrl => {
                data.push(c);
                let mut tmp = [0u8; 4];
                echo(c.encode_utf8(&mut tmp));
            },
            _ => {},
        }
    }

    if !data.is_empty() {
        let _ = daemon_dispatch.send(Message::input_data(data));
    }
    let _ = daemon_dispatch.send(Message::input_eof());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn interactive_keys_forward_as_keystrokes() {
        assert_eq!(
            classify(&key(KeyCode::Char('+'), KeyModifiers::NONE)),
            KeyAction::Forward('+')
        );
        assert_eq!(
            classify(&key(KeyCode::Char('-'), KeyModifiers::NONE)),
            KeyAction::Forward('-')
        );
        assert_eq!(
            classify(&key(KeyCode::Char('b'), KeyModifiers::CONTROL)),
            KeyAction::Forward('\u{2}')
        );
        assert_eq!(
            classify(&key(KeyCode::Char('l'), KeyModifiers::CONTROL)),
            KeyAction::Forward('\u{c}')
        );
        assert_eq!(
            classify(&key(KeyCode::Char('m'), KeyModifiers::CONTROL)),
            KeyAction::Forward('\u{d}')
        );
        assert_eq!(classify(&key(KeyCode::Enter, KeyModifiers::NONE)), KeyAction::Forward('\u{d}'));
    }

    #[test]
    fn ctrl_c_cancels_and_other_keys_are_ignored() {
        assert_eq!(classify(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)), KeyAction::Cancel);
        assert_eq!(classify(&key(KeyCode::Char('x'), KeyModifiers::NONE)), KeyAction::Ignore);
        assert_eq!(classify(&key(KeyCode::Esc, KeyModifiers::NONE)), KeyAction::Ignore);
    }

    #[test]
    fn line_editor_collects_and_erases() {
        let mut editor = LineEditor::new(false);
        assert_eq!(
            editor.feed(&key(KeyCode::Char('h'), KeyModifiers::NONE)),
            EditStep::Pending(Some('h'))
        );
        editor.feed(&key(KeyCode::Char('i'), KeyModifiers::NONE));
        assert_eq!(editor.feed(&key(KeyCode::Backspace, KeyModifiers::NONE)), EditStep::Erase);
        assert_eq!(editor.feed(&key(KeyCode::Enter, KeyModifiers::NONE)), EditStep::Done);
        assert_eq!(editor.into_line(), "h");
    }

    #[test]
    fn password_mode_masks_the_echo() {
        let mut editor = LineEditor::new(true);
        assert_eq!(
            editor.feed(&key(KeyCode::Char('s'), KeyModifiers::NONE)),
            EditStep::Pending(Some('*'))
        );
        assert_eq!(editor.into_line(), "s");
    }

    #[test]
    fn ctrl_c_cancels_a_modal_read() {
        let mut editor = LineEditor::new(false);
        assert_eq!(
            editor.feed(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            EditStep::Canceled
        );
    }
}
