//! Hierarchical authorization engine for access-controlled applications
//!
//! This crate answers the question *"may subject S exercise privilege P on
//! object O?"* over three independent DAGs — subjects, objects, and
//! privileges — with explicit positive and negative rules that propagate
//! through the graphs:
//!
//! - **Entities**: subjects, objects, and privileges, each in its own
//!   hierarchy with a distinguished `"*"` supremum at the top
//! - **Rules**: signed `(subject, object, privilege)` triples; a grant on
//!   an ancestor reaches every descendant, a deny always wins
//! - **Decisions**: closed-world, negative-first evaluation backed by a
//!   transitive-closure index so checks stay on the request path
//! - **Declarations**: a reconciler that converges persisted static state
//!   to an application-supplied baseline on start-up
//!
//! # Example
//!
//! ```rust
//! use auth_lattice::{AuthorizationEngine, Decision, InMemoryAccessRepository};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = AuthorizationEngine::new(Arc::new(InMemoryAccessRepository::new())).await?;
//!
//!     engine.register_subject("alice", "Alice").await?;
//!     engine.register_object("doc", "The document").await?;
//!     engine.register_permission("edit", "Modify content").await?;
//!
//!     engine.grant("alice", "doc", "edit").await?;
//!     assert_eq!(engine.check("alice", "doc", "edit").await?, Decision::Granted);
//!
//!     Ok(())
//! }
//! ```

pub mod decision;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod ident;
pub mod models;
pub mod reconcile;
pub mod repository;
pub mod rules;
pub mod settings;

pub use engine::AuthorizationEngine;
pub use error::{LatticeError, Result};
pub use ident::RawId;
pub use models::{Decision, Entity, EntityKind, Rule, RuleEntry, RuleSide, RuleSign, SUPREMUM};
pub use reconcile::{CollectionDecl, Declarations, PermissionDecl, RoleDecl, RuleDecl};
pub use repository::postgres::PostgresAccessRepository;
pub use repository::{AccessRepository, InMemoryAccessRepository};
pub use settings::EngineSettings;
