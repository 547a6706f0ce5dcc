pub mod protocol;
mod session;
mod transcript;
pub mod transport;

pub use session::{ConnectionState, LiveSession, SessionEvent};
pub use transcript::{PendingTurn, TranscriptAggregator, Turn};
pub use transport::{EventSender, SessionTransport, TransportEvent, TransportHandle, WebSocketTransport};
