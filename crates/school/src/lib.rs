//! School administration demo on top of the orchestration engine.
//!
//! Registering a student is a sequential macro-operation (create, then
//! enroll); deleting students is a parallel one. Both run every registry
//! write inside a thread-bound transaction supplied by a decorator.

pub mod commands;
pub mod error;
pub mod registry;
pub mod service;
pub mod transaction;

pub use commands::{
    CreateStudent, DeleteRequest, DeleteStudent, EnrollStudent, Enrollment, NewStudent,
};
pub use error::{RegistryError, SchoolError};
pub use registry::{InMemoryStudentRegistry, Student};
pub use service::{Registration, SchoolService};
pub use transaction::{
    Outcome, TransactionManager, TransactionRecord, Transactional, TransactionalDecorator,
    current_transaction,
};
