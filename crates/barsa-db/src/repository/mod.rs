//! # Repository Module
//!
//! Raw SQL access behind small repository types.
//!
//! ```text
//!  LocalStore ──► CollectionRepository ──► collections (one JSON array per row)
//!  UploadPropagator ──► DeadLetterRepository ──► sync_dead_letters
//! ```
//!
//! ## Available Repositories
//!
//! - [`CollectionRepository`](collection::CollectionRepository) - Raw collection payloads
//! - [`DeadLetterRepository`](dead_letter::DeadLetterRepository) - Mirror writes that ran out of retries

pub mod collection;
pub mod dead_letter;
