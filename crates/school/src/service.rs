//! School administration service built from reversible operations.

use std::sync::Arc;

use orchestration::{
    CompositeOperation, CompositeSettings, ContextState, ExecutionContext, ExecutionError,
    FinalResult, Input, Leaf, MacroExecutionParameter, MacroHooks, Operation,
    OrchestrationConfig, ParallelExecutor, Result, SequentialExecutor, SharedOperation,
    WorkerPool, wire,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::commands::{
    CREATE_STUDENT, CreateStudent, DeleteRequest, DeleteStudent, ENROLL_STUDENT, EnrollStudent,
};
use crate::error::SchoolError;
use crate::registry::{InMemoryStudentRegistry, Student};
use crate::transaction::{TransactionManager, TransactionalDecorator};

pub const REGISTER_STUDENT: &str = "register-student";
pub const DELETE_STUDENTS: &str = "delete-students";

/// Input of [`SchoolService::register`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub course: String,
}

impl Registration {
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        course: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            course: course.into(),
        }
    }
}

/// Create-then-enroll: the new student's id is handed to the enrollment,
/// and the macro result is the created student.
struct RegistrationHooks;

impl MacroHooks for RegistrationHooks {
    fn transfer_result(
        &self,
        previous: &dyn Operation,
        previous_result: &Value,
        current: &mut ExecutionContext,
    ) -> Result<()> {
        let cannot_transfer = ExecutionError::CannotTransferResult {
            from: previous.id().to_string(),
            to: current.owner_id().to_string(),
        };
        if previous.id() != CREATE_STUDENT || current.owner_id() != ENROLL_STUDENT {
            return Err(cannot_transfer);
        }
        let Some(student_id) = previous_result.get("id").cloned() else {
            return Err(cannot_transfer);
        };
        match current.redo_input_mut()? {
            Input::Value(Value::Object(fields)) => {
                fields.insert("student_id".to_string(), student_id);
                Ok(())
            }
            _ => Err(cannot_transfer),
        }
    }

    fn final_result(&self, contexts: &[ExecutionContext]) -> Result<Value> {
        FinalResult::OwnedBy(CREATE_STUDENT.to_string()).compute(contexts)
    }
}

/// Student administration over an [`InMemoryStudentRegistry`].
///
/// Every operation is wrapped by a [`TransactionalDecorator`]; registry
/// writes therefore always run on the calling thread, inside a transaction,
/// even when nested operations fan out over the worker pool.
pub struct SchoolService {
    registry: InMemoryStudentRegistry,
    transactions: Arc<TransactionManager>,
    register: SharedOperation,
    delete: SharedOperation,
    delete_many: SharedOperation,
}

impl SchoolService {
    pub fn new(
        registry: InMemoryStudentRegistry,
        config: &OrchestrationConfig,
    ) -> std::result::Result<Self, SchoolError> {
        let pool = Arc::new(WorkerPool::from_config(config)?);
        let transactions = TransactionManager::new();
        let decorator = TransactionalDecorator::new(Arc::clone(&transactions));
        let settings = CompositeSettings::from(config);

        let create = wire(&decorator, |self_ref| {
            Leaf::new(self_ref, CreateStudent::new(registry.clone()))
        });
        let enroll = wire(&decorator, |self_ref| {
            Leaf::new(self_ref, EnrollStudent::new(registry.clone()))
        });
        let delete = wire(&decorator, |self_ref| {
            Leaf::new(self_ref, DeleteStudent::new(registry.clone()))
        });

        let register = wire(&decorator, |self_ref| {
            CompositeOperation::new(
                REGISTER_STUDENT,
                self_ref,
                Arc::new(SequentialExecutor),
                Arc::new(RegistrationHooks),
            )
            .with_settings(settings)
            .with_nested([create, enroll])
        });
        let delete_many = wire(&decorator, |self_ref| {
            CompositeOperation::new(
                DELETE_STUDENTS,
                self_ref,
                Arc::new(ParallelExecutor::from_config(pool, config)),
                Arc::new(FinalResult::AllTrue),
            )
            .with_settings(settings)
            .with_nested([Arc::clone(&delete)])
        });

        Ok(Self {
            registry,
            transactions,
            register,
            delete,
            delete_many,
        })
    }

    pub fn registry(&self) -> &InMemoryStudentRegistry {
        &self.registry
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    /// Creates a student and enrolls them; neither happens if either fails.
    #[tracing::instrument(skip(self), fields(email = %registration.email))]
    pub fn register(
        &self,
        registration: Registration,
    ) -> std::result::Result<Student, SchoolError> {
        let context = self.register_context(registration)?;
        let student = context
            .result_as::<Student>()?
            .ok_or_else(|| ExecutionError::MissingNestedContext(REGISTER_STUDENT.to_string()))?;
        Ok(student)
    }

    /// Like [`register`](Self::register), keeping the context for [`undo`](Self::undo).
    pub fn register_context(
        &self,
        registration: Registration,
    ) -> std::result::Result<ExecutionContext, SchoolError> {
        self.run(&self.register, Input::value(&registration)?)
    }

    /// Deletes students concurrently; all of them or none.
    ///
    /// Returns whether every request matched a student.
    #[tracing::instrument(skip(self, requests), fields(count = requests.len()))]
    pub fn delete_students(
        &self,
        requests: Vec<DeleteRequest>,
    ) -> std::result::Result<bool, SchoolError> {
        let nested = requests
            .iter()
            .map(|request| Ok(self.delete.create_context(Input::value(request)?)))
            .collect::<Result<Vec<_>>>()?;
        let input = Input::Macro(MacroExecutionParameter::new(nested));
        let context = self.run(&self.delete_many, input)?;
        Ok(context.result_as::<bool>()?.unwrap_or(false))
    }

    /// Reverts an operation that completed earlier.
    pub fn undo(&self, context: &mut ExecutionContext) -> std::result::Result<(), SchoolError> {
        let operation = context
            .owner()
            .ok_or_else(|| ExecutionError::Unbound(context.owner_id().to_string()))?;
        operation.undo_operation(context)?;
        match context.state() {
            ContextState::Undone => Ok(()),
            _ => Err(failed(context)),
        }
    }

    fn run(
        &self,
        operation: &SharedOperation,
        input: Input,
    ) -> std::result::Result<ExecutionContext, SchoolError> {
        let mut context = operation.create_context(input);
        operation.do_operation(&mut context)?;
        match context.state() {
            ContextState::Done => Ok(context),
            _ => Err(failed(&context)),
        }
    }
}

fn failed(context: &ExecutionContext) -> SchoolError {
    SchoolError::Failed {
        operation: context.owner_id().to_string(),
        source: context.error().cloned().unwrap_or_else(|| {
            ExecutionError::rejected(context.owner_id(), format!("ended in {}", context.state()))
        }),
    }
}
