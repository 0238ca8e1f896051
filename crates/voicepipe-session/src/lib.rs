pub mod session;

pub use session::VoiceSession;
