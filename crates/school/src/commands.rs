//! Business commands over the student registry.

use orchestration::{Command, ExecutionError, Executed, Input, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::registry::{InMemoryStudentRegistry, Student};

pub const CREATE_STUDENT: &str = "create-student";
pub const ENROLL_STUDENT: &str = "enroll-student";
pub const DELETE_STUDENT: &str = "delete-student";

/// Payload of [`CreateStudent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStudent {
    pub name: String,
    pub email: String,
}

/// Payload of [`EnrollStudent`]. The student id may arrive from a previous step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    #[serde(default)]
    pub student_id: Option<String>,
    pub course: String,
}

/// Payload of [`DeleteStudent`]: a student id, or an email resolved to one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl DeleteRequest {
    pub fn by_id(student_id: impl Into<String>) -> Self {
        Self {
            student_id: Some(student_id.into()),
            email: None,
        }
    }

    pub fn by_email(email: impl Into<String>) -> Self {
        Self {
            student_id: None,
            email: Some(email.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Removed {
    student: Student,
    courses: Vec<String>,
}

fn decode<T: serde::de::DeserializeOwned>(operation: &str, input: &Input) -> Result<T> {
    input
        .decode()
        .map_err(|e| ExecutionError::invalid_input(operation, e.to_string()))
}

/// Registers a new student.
#[derive(Debug, Clone)]
pub struct CreateStudent {
    registry: InMemoryStudentRegistry,
}

impl CreateStudent {
    pub fn new(registry: InMemoryStudentRegistry) -> Self {
        Self { registry }
    }
}

impl Command for CreateStudent {
    fn name(&self) -> &str {
        CREATE_STUDENT
    }

    fn validate(&self, input: &Input) -> Result<()> {
        let student: NewStudent = decode(CREATE_STUDENT, input)?;
        if student.name.trim().is_empty() {
            return Err(ExecutionError::invalid_input(CREATE_STUDENT, "name is empty"));
        }
        if !student.email.contains('@') {
            return Err(ExecutionError::invalid_input(
                CREATE_STUDENT,
                format!("'{}' is not an email address", student.email),
            ));
        }
        Ok(())
    }

    fn execute(&self, input: &Value) -> Result<Executed> {
        let request: NewStudent = serde_json::from_value(input.clone())?;
        let student = self
            .registry
            .create(&request.name, &request.email)
            .map_err(|e| e.into_execution(CREATE_STUDENT))?;
        tracing::info!(student = %student.id, "student created");
        Ok(Executed::new(
            serde_json::to_value(&student)?,
            json!({ "student_id": student.id }),
        ))
    }

    fn rollback(&self, undo: &Value) -> Result<()> {
        let Some(student_id) = undo["student_id"].as_str() else {
            return Err(ExecutionError::rollback_failed(CREATE_STUDENT, "no student id"));
        };
        self.registry
            .delete(student_id)
            .map_err(|e| ExecutionError::rollback_failed(CREATE_STUDENT, e.to_string()))?;
        tracing::info!(student = student_id, "student creation reverted");
        Ok(())
    }
}

/// Enrolls a student in a course.
#[derive(Debug, Clone)]
pub struct EnrollStudent {
    registry: InMemoryStudentRegistry,
}

impl EnrollStudent {
    pub fn new(registry: InMemoryStudentRegistry) -> Self {
        Self { registry }
    }
}

impl Command for EnrollStudent {
    fn name(&self) -> &str {
        ENROLL_STUDENT
    }

    fn validate(&self, input: &Input) -> Result<()> {
        let enrollment: Enrollment = decode(ENROLL_STUDENT, input)?;
        if enrollment.course.trim().is_empty() {
            return Err(ExecutionError::invalid_input(ENROLL_STUDENT, "course is empty"));
        }
        Ok(())
    }

    fn execute(&self, input: &Value) -> Result<Executed> {
        let enrollment: Enrollment = serde_json::from_value(input.clone())?;
        let Some(student_id) = enrollment.student_id else {
            return Err(ExecutionError::invalid_input(ENROLL_STUDENT, "no student id"));
        };
        self.registry
            .enroll(&student_id, &enrollment.course)
            .map_err(|e| e.into_execution(ENROLL_STUDENT))?;
        let record = json!({ "student_id": student_id, "course": enrollment.course });
        Ok(Executed::new(record.clone(), record))
    }

    fn rollback(&self, undo: &Value) -> Result<()> {
        let (Some(student_id), Some(course)) =
            (undo["student_id"].as_str(), undo["course"].as_str())
        else {
            return Err(ExecutionError::rollback_failed(ENROLL_STUDENT, "incomplete enrollment"));
        };
        self.registry
            .withdraw(student_id, course)
            .map_err(|e| ExecutionError::rollback_failed(ENROLL_STUDENT, e.to_string()))
    }
}

/// Deletes a student together with their enrollments.
///
/// Yields `true` when a student was deleted and `false` when there was none.
#[derive(Debug, Clone)]
pub struct DeleteStudent {
    registry: InMemoryStudentRegistry,
}

impl DeleteStudent {
    pub fn new(registry: InMemoryStudentRegistry) -> Self {
        Self { registry }
    }
}

impl Command for DeleteStudent {
    fn name(&self) -> &str {
        DELETE_STUDENT
    }

    fn validate(&self, input: &Input) -> Result<()> {
        let request: DeleteRequest = decode(DELETE_STUDENT, input)?;
        if request.student_id.is_none() && request.email.is_none() {
            return Err(ExecutionError::invalid_input(
                DELETE_STUDENT,
                "either a student id or an email is required",
            ));
        }
        Ok(())
    }

    /// Resolves an email to a student id with a read-only lookup.
    fn prefetch(&self, input: &mut Input) -> Result<()> {
        let mut request: DeleteRequest = decode(DELETE_STUDENT, input)?;
        if request.student_id.is_some() {
            return Ok(());
        }
        if let Some(email) = &request.email {
            request.student_id = self.registry.find_by_email(email).map(|s| s.id);
        }
        *input = Input::value(&request)?;
        Ok(())
    }

    fn execute(&self, input: &Value) -> Result<Executed> {
        let request: DeleteRequest = serde_json::from_value(input.clone())?;
        let Some(student_id) = request.student_id else {
            return Ok(Executed::new(json!(false), Value::Null));
        };
        let removed = self
            .registry
            .delete(&student_id)
            .map_err(|e| e.into_execution(DELETE_STUDENT))?;
        match removed {
            Some((student, courses)) => {
                tracing::info!(student = %student.id, "student deleted");
                let undo = serde_json::to_value(Removed { student, courses })?;
                Ok(Executed::new(json!(true), undo))
            }
            None => Ok(Executed::new(json!(false), Value::Null)),
        }
    }

    fn rollback(&self, undo: &Value) -> Result<()> {
        if undo.is_null() {
            return Ok(());
        }
        let removed: Removed = serde_json::from_value(undo.clone())?;
        self.registry
            .restore(removed.student, removed.courses)
            .map_err(|e| ExecutionError::rollback_failed(DELETE_STUDENT, e.to_string()))
    }
}
