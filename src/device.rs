//! In-memory device model shared by all sessions
//!
//! Holds the simulated terminal's users, fingerprint templates and attendance
//! log. Counts reported to clients are always recomputed from the backing
//! collections, never incremented.

use std::sync::{Arc, Mutex};

use crate::types::{AttendanceRecord, FingerTemplate, SimulatorConfig, User};

/// Handle shared between the listener and every session task
pub type SharedModel = Arc<Mutex<DeviceModel>>;

/// Current and maximum record counts, as reported by GET_FREE_SIZES
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySnapshot {
    pub users: u32,
    pub fingers: u32,
    pub records: u32,
    pub users_capacity: u32,
    pub fingers_capacity: u32,
    pub records_capacity: u32,
}

/// Simulated terminal state
#[derive(Debug)]
pub struct DeviceModel {
    users: Vec<User>,
    templates: Vec<FingerTemplate>,
    attendance: Vec<AttendanceRecord>,
    users_capacity: u32,
    fingers_capacity: u32,
    records_capacity: u32,
}

impl DeviceModel {
    /// Empty model with the configured capacities
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            users: Vec::new(),
            templates: Vec::new(),
            attendance: Vec::new(),
            users_capacity: config.users_capacity,
            fingers_capacity: config.fingers_capacity,
            records_capacity: config.records_capacity,
        }
    }

    /// Model pre-loaded with the stock demo users
    pub fn with_seed_users(config: &SimulatorConfig) -> Self {
        let mut model = Self::new(config);
        for (uid, password, name, card) in [
            (1u16, "", "Admin", 0u32),
            (2, "12345", "User001", 123456),
            (3, "", "User002", 234567),
        ] {
            model.set_user(User {
                uid,
                privilege: 0,
                password: password.to_string(),
                name: name.to_string(),
                card,
                group: "0".to_string(),
                user_id: uid.to_string(),
            });
        }
        model
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    /// Insert or replace by uid. A matching uid keeps its position in the
    /// list; a new uid is appended.
    pub fn set_user(&mut self, user: User) {
        match self.users.iter_mut().find(|u| u.uid == user.uid) {
            Some(existing) => *existing = user,
            None => self.users.push(user),
        }
    }

    /// Remove a user and every template it owns
    pub fn delete_user(&mut self, uid: u16) {
        self.users.retain(|u| u.uid != uid);
        self.templates.retain(|t| t.uid != uid);
    }

    pub fn find_uid_by_user_id(&self, user_id: &str) -> Option<u16> {
        self.users.iter().find(|u| u.user_id == user_id).map(|u| u.uid)
    }

    pub fn templates(&self) -> &[FingerTemplate] {
        &self.templates
    }

    pub fn template(&self, uid: u16, finger: u8) -> Option<&FingerTemplate> {
        self.templates
            .iter()
            .find(|t| t.uid == uid && t.finger == finger)
    }

    /// Insert or replace by `(uid, finger)`
    pub fn set_template(&mut self, template: FingerTemplate) {
        self.templates
            .retain(|t| !(t.uid == template.uid && t.finger == template.finger));
        self.templates.push(template);
    }

    pub fn delete_template(&mut self, uid: u16, finger: u8) {
        self.templates
            .retain(|t| !(t.uid == uid && t.finger == finger));
    }

    pub fn attendance(&self) -> &[AttendanceRecord] {
        &self.attendance
    }

    pub fn add_attendance(&mut self, record: AttendanceRecord) {
        self.attendance.push(record);
    }

    pub fn clear_attendance(&mut self) {
        self.attendance.clear();
    }

    /// Counts recomputed from the collections plus the configured maxima
    pub fn capacity(&self) -> CapacitySnapshot {
        CapacitySnapshot {
            users: self.users.len() as u32,
            fingers: self.templates.len() as u32,
            records: self.attendance.len() as u32,
            users_capacity: self.users_capacity,
            fingers_capacity: self.fingers_capacity,
            records_capacity: self.records_capacity,
        }
    }
}
