//! Contracts shared between the engine core and the languages it hosts.

pub mod env;
pub mod language;
pub mod thread;

pub use language::{
    LanguageContext, LanguageEnv, LanguageProvider, SharedReader, SharedWriter, shared_reader,
    shared_writer,
};
pub use thread::{Interrupted, ThreadHandle, ThreadKey, park_interruptibly};
