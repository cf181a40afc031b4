//! Interaction channel binding one transport task to one decision loop.
//!
//! ```text
//!                 input (InputLine)
//!   Manager ──┐                         ┌──> Transport ──> remote shell
//!   Decision ─┴─────────────────────────┘        │
//!                                                │ output (OutputEvent)
//!   Decision <───────────────────────────────────┘
//! ```
//!
//! Both queues are unbounded FIFOs, so ordering is preserved per session. The stop
//! signal is a [`CancellationToken`]: once cancelled it stays cancelled.
//!
//! When the transport writes a caller command it first emits
//! [`OutputEvent::Dispatched`] on the output queue. The decision loop therefore sees
//! output produced before the write, the dispatch marker, and output produced after
//! it, in that order.

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;

/// A line to be written to the remote shell (a trailing newline is appended).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLine {
    /// Command sent by a caller through the manager
    Command(String),
    /// Automatic answer from the decision loop (password, confirmation)
    Reply(String),
}

impl InputLine {
    pub fn text(&self) -> &str {
        match self {
            InputLine::Command(text) | InputLine::Reply(text) => text,
        }
    }
}

/// Items flowing from the transport to the decision loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Decoded shell output
    Chunk(String),
    /// A caller command is about to be written
    Dispatched(String),
    /// Diagnostic marker for a failure that ends the transport
    Fatal(String),
}

/// Ends owned by the transport task.
pub struct TransportEnd {
    pub output_tx: UnboundedSender<OutputEvent>,
    pub input_rx: UnboundedReceiver<InputLine>,
    pub stop: CancellationToken,
}

/// Ends owned by the decision loop.
pub struct DecisionEnd {
    pub output_rx: UnboundedReceiver<OutputEvent>,
    pub input_tx: UnboundedSender<InputLine>,
    pub stop: CancellationToken,
}

/// Ends kept by the manager.
#[derive(Clone)]
pub struct ControlEnd {
    input_tx: UnboundedSender<InputLine>,
    stop: CancellationToken,
}

impl ControlEnd {
    /// Queue a caller command. Returns `false` once the transport is gone.
    pub fn send_command(&self, command: impl Into<String>) -> bool {
        self.input_tx
            .send(InputLine::Command(command.into()))
            .is_ok()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// Create the queues and stop signal for one session.
pub fn interaction_channel() -> (TransportEnd, DecisionEnd, ControlEnd) {
    let (output_tx, output_rx) = unbounded_channel();
    let (input_tx, input_rx) = unbounded_channel();
    let stop = CancellationToken::new();

    (
        TransportEnd {
            output_tx,
            input_rx,
            stop: stop.clone(),
        },
        DecisionEnd {
            output_rx,
            input_tx: input_tx.clone(),
            stop: stop.clone(),
        },
        ControlEnd { input_tx, stop },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_and_replies_share_one_fifo() {
        let (mut transport, decision, control) = interaction_channel();

        assert!(control.send_command("ls"));
        decision
            .input_tx
            .send(InputLine::Reply("secret".to_string()))
            .unwrap();
        assert!(control.send_command("pwd"));

        assert_eq!(
            transport.input_rx.recv().await,
            Some(InputLine::Command("ls".to_string()))
        );
        assert_eq!(
            transport.input_rx.recv().await,
            Some(InputLine::Reply("secret".to_string()))
        );
        assert_eq!(
            transport.input_rx.recv().await,
            Some(InputLine::Command("pwd".to_string()))
        );
    }

    #[tokio::test]
    async fn test_output_preserves_order() {
        let (transport, mut decision, _control) = interaction_channel();
        for i in 0..10 {
            transport
                .output_tx
                .send(OutputEvent::Chunk(i.to_string()))
                .unwrap();
        }
        for i in 0..10 {
            assert_eq!(
                decision.output_rx.recv().await,
                Some(OutputEvent::Chunk(i.to_string()))
            );
        }
    }

    #[test]
    fn test_stop_is_shared_and_latched() {
        let (transport, decision, control) = interaction_channel();
        assert!(!control.is_stopped());
        control.stop();
        assert!(transport.stop.is_cancelled());
        assert!(decision.stop.is_cancelled());
        control.stop();
        assert!(control.is_stopped());
    }

    #[test]
    fn test_send_fails_after_transport_dropped() {
        let (transport, decision, control) = interaction_channel();
        drop(transport);
        drop(decision);
        assert!(!control.send_command("ls"));
    }

    #[test]
    fn test_input_line_text() {
        assert_eq!(InputLine::Command("ls".to_string()).text(), "ls");
        assert_eq!(InputLine::Reply("y".to_string()).text(), "y");
    }
}
