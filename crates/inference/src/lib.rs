//! # moss-infer: Chat Runtime
//!
//! * **[`provision`]**: validate the launch, resolve a model id to a local
//!   snapshot directory.
//! * **[`tokenizer`]**: load `tokenizer.json` or assemble one from GPT-2 files.
//! * **[`GenerationConfig`]**: the fixed decoding settings.
//! * **[`MossRuntime`]**: load the model, generate tokens.
//! * **[`ChatSession`]**: the interactive loop over a [`Responder`].

pub mod conversation;
pub mod generation;
pub mod provision;
pub mod runtime;
pub mod tokenizer;

pub use conversation::{ChatSession, Command, EncodeError, Responder, Transcript, Turn};
pub use generation::GenerationConfig;
pub use provision::{launch, resolve_model_dir, snapshot_download};
pub use runtime::MossRuntime;
pub use tokenizer::load_tokenizer;
