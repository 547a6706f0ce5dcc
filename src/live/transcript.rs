use serde::Serialize;

/// One finished exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub user_text: String,
    pub model_text: String,
}

/// Text of the turn still in progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingTurn {
    pub input: String,
    pub output: String,
}

impl PendingTurn {
    pub fn is_empty(&self) -> bool {
        self.input.is_empty() && self.output.is_empty()
    }
}

/// Accumulates streamed transcription fragments into turns.
///
/// Fragments are appended to the state held here, never to a copy the
/// caller took earlier, so a burst of messages cannot lose text.
#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    input: String,
    output: String,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_input(&mut self, text: &str) {
        self.input.push_str(text);
    }

    pub fn append_output(&mut self, text: &str) {
        self.output.push_str(text);
    }

    /// Close the current turn. Whitespace-only turns are dropped.
    pub fn finalize_turn(&mut self) -> Option<Turn> {
        let user_text = std::mem::take(&mut self.input);
        let model_text = std::mem::take(&mut self.output);

        if user_text.trim().is_empty() && model_text.trim().is_empty() {
            return None;
        }
        Some(Turn {
            user_text,
            model_text,
        })
    }

    pub fn pending(&self) -> PendingTurn {
        PendingTurn {
            input: self.input.clone(),
            output: self.output.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.input.clear();
        self.output.clear();
    }
}
