pub(super) use crate::workflows::testing::*;

use crate::workflows::enrollment::{NewClass, NewEnrollment};

/// A second child in the same year and level as [`amadou`].
pub(super) fn fatou(year: i32) -> NewEnrollment {
    NewEnrollment {
        first_name: "Fatou".to_string(),
        birth_date: chrono::NaiveDate::from_ymd_opt(2015, 9, 2).expect("valid date"),
        ..amadou(year)
    }
}

pub(super) fn small_class(capacity: i64) -> NewClass {
    NewClass {
        year: 2025,
        level: "Première Communion".to_string(),
        label: "Groupe Saint Paul".to_string(),
        capacity,
        instructors: Vec::new(),
    }
}
