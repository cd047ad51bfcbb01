//! In-memory student registry.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::transaction::current_transaction;

/// A registered student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub email: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryState {
    students: HashMap<String, Student>,
    enrollments: HashMap<String, BTreeSet<String>>,
    next_id: u32,
    fail_on_create: bool,
    fail_on_enroll: bool,
    fail_on_delete: HashSet<String>,
    fail_on_restore: bool,
}

/// In-memory registry of students and course enrollments.
///
/// Reads are allowed anywhere; writes require a transaction open on the
/// calling thread.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStudentRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl InMemoryStudentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the registry to fail on create calls.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.state.write().unwrap().fail_on_create = fail;
    }

    /// Configures the registry to fail on enroll calls.
    pub fn set_fail_on_enroll(&self, fail: bool) {
        self.state.write().unwrap().fail_on_enroll = fail;
    }

    /// Configures the registry to fail when deleting the given student.
    pub fn set_fail_on_delete(&self, student_id: &str, fail: bool) {
        let mut state = self.state.write().unwrap();
        if fail {
            state.fail_on_delete.insert(student_id.to_string());
        } else {
            state.fail_on_delete.remove(student_id);
        }
    }

    /// Configures the registry to fail when restoring a deleted student.
    pub fn set_fail_on_restore(&self, fail: bool) {
        self.state.write().unwrap().fail_on_restore = fail;
    }

    pub fn student_count(&self) -> usize {
        self.state.read().unwrap().students.len()
    }

    pub fn get(&self, id: &str) -> Option<Student> {
        self.state.read().unwrap().students.get(id).cloned()
    }

    pub fn find_by_email(&self, email: &str) -> Option<Student> {
        self.state
            .read()
            .unwrap()
            .students
            .values()
            .find(|student| student.email == email)
            .cloned()
    }

    /// Courses the student is enrolled in, sorted.
    pub fn courses(&self, id: &str) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .enrollments
            .get(id)
            .map(|courses| courses.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn create(&self, name: &str, email: &str) -> Result<Student, RegistryError> {
        require_transaction()?;
        let mut state = self.state.write().unwrap();

        if state.fail_on_create {
            return Err(RegistryError::Unavailable("create".to_string()));
        }
        if state.students.values().any(|student| student.email == email) {
            return Err(RegistryError::DuplicateEmail(email.to_string()));
        }

        state.next_id += 1;
        let student = Student {
            id: format!("STU-{:04}", state.next_id),
            name: name.to_string(),
            email: email.to_string(),
            registered_at: Utc::now(),
        };
        state.students.insert(student.id.clone(), student.clone());
        Ok(student)
    }

    pub fn enroll(&self, student_id: &str, course: &str) -> Result<(), RegistryError> {
        require_transaction()?;
        let mut state = self.state.write().unwrap();

        if state.fail_on_enroll {
            return Err(RegistryError::Unavailable("enroll".to_string()));
        }
        if !state.students.contains_key(student_id) {
            return Err(RegistryError::UnknownStudent(student_id.to_string()));
        }
        state
            .enrollments
            .entry(student_id.to_string())
            .or_default()
            .insert(course.to_string());
        Ok(())
    }

    pub fn withdraw(&self, student_id: &str, course: &str) -> Result<(), RegistryError> {
        require_transaction()?;
        let mut state = self.state.write().unwrap();
        if let Some(courses) = state.enrollments.get_mut(student_id) {
            courses.remove(course);
        }
        Ok(())
    }

    /// Deletes a student and their enrollments, returning what was removed.
    pub fn delete(&self, id: &str) -> Result<Option<(Student, Vec<String>)>, RegistryError> {
        require_transaction()?;
        let mut state = self.state.write().unwrap();

        if state.fail_on_delete.contains(id) {
            return Err(RegistryError::Unavailable(format!("delete of {id}")));
        }
        let Some(student) = state.students.remove(id) else {
            return Ok(None);
        };
        let courses = state
            .enrollments
            .remove(id)
            .map(|courses| courses.into_iter().collect())
            .unwrap_or_default();
        Ok(Some((student, courses)))
    }

    /// Puts back a student removed by [`delete`](Self::delete).
    pub fn restore(&self, student: Student, courses: Vec<String>) -> Result<(), RegistryError> {
        require_transaction()?;
        let mut state = self.state.write().unwrap();

        if state.fail_on_restore {
            return Err(RegistryError::Unavailable("restore".to_string()));
        }
        if !courses.is_empty() {
            state
                .enrollments
                .insert(student.id.clone(), courses.into_iter().collect());
        }
        state.students.insert(student.id.clone(), student);
        Ok(())
    }
}

fn require_transaction() -> Result<(), RegistryError> {
    current_transaction()
        .map(|_| ())
        .ok_or(RegistryError::NoTransaction)
}
