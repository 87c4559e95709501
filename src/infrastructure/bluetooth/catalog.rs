//! Resolved GATT layout of one connection.

use crate::infrastructure::bluetooth::protocol::{uuid_matches, CharacteristicRole};
use crate::infrastructure::bluetooth::transport::{CharRef, ServiceRef};
use std::collections::BTreeMap;

/// Services and characteristics discovered on the current connection
#[derive(Debug, Default, Clone)]
pub struct ServiceCatalog {
    services: Vec<(ServiceRef, Vec<CharRef>)>,
    roles: BTreeMap<CharacteristicRole, CharRef>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a service and bind any characteristic that fills a role
    pub fn insert_service(&mut self, service: ServiceRef, characteristics: Vec<CharRef>) {
        for characteristic in &characteristics {
            let uuid = characteristic.uuid_string();
            for role in CharacteristicRole::ALL {
                if !self.roles.contains_key(&role) && uuid_matches(&uuid, role.uuid()) {
                    self.roles.insert(role, characteristic.clone());
                }
            }
        }
        self.services.push((service, characteristics));
    }

    /// Look up a characteristic by short (containment) or full (exact) UUID
    pub fn find(&self, uuid: &str) -> Option<&CharRef> {
        self.services
            .iter()
            .flat_map(|(_, chars)| chars.iter())
            .find(|c| uuid_matches(&c.uuid_string(), uuid))
    }

    pub fn get(&self, role: CharacteristicRole) -> Option<&CharRef> {
        self.roles.get(&role)
    }

    /// Required roles that have not resolved yet
    pub fn missing_required(&self) -> Vec<CharacteristicRole> {
        CharacteristicRole::REQUIRED
            .into_iter()
            .filter(|role| !self.roles.contains_key(role))
            .collect()
    }

    /// True iff every required role resolved
    pub fn is_ready(&self) -> bool {
        self.missing_required().is_empty()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|(_, c)| c.len()).sum()
    }

    pub fn clear(&mut self) {
        self.services.clear();
        self.roles.clear();
    }
}

/// Characteristics with an active notify subscription
///
/// A characteristic appears at most once.
#[derive(Debug, Default, Clone)]
pub struct NotifyingSet {
    entries: Vec<CharRef>,
}

impl NotifyingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the characteristic was already present
    pub fn insert(&mut self, characteristic: CharRef) -> bool {
        if self.contains(&characteristic) {
            return false;
        }
        self.entries.push(characteristic);
        true
    }

    /// Remove a match at any position; returns whether one was removed
    pub fn remove(&mut self, characteristic: &CharRef) -> bool {
        match self.entries.iter().position(|c| c == characteristic) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, characteristic: &CharRef) -> bool {
        self.entries.contains(characteristic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every entry, leaving the set empty
    pub fn drain(&mut self) -> Vec<CharRef> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{COMMAND_UUID, DATA_STREAM_UUID};
    use crate::infrastructure::bluetooth::transport::CharProperties;
    use uuid::Uuid;

    fn characteristic(uuid: &str, handle: u16, properties: CharProperties) -> CharRef {
        CharRef {
            service: Uuid::nil(),
            uuid: Uuid::parse_str(uuid).unwrap(),
            handle,
            properties,
        }
    }

    fn service(handle: u16) -> ServiceRef {
        ServiceRef {
            uuid: Uuid::from_u128(handle as u128),
            handle,
        }
    }

    #[test]
    fn test_find_by_short_and_full_uuid() {
        let mut catalog = ServiceCatalog::new();
        catalog.insert_service(
            service(1),
            vec![characteristic(
                "00002a19-0000-1000-8000-00805f9b34fb",
                3,
                CharProperties::READ,
            )],
        );
        catalog.insert_service(
            service(2),
            vec![characteristic(COMMAND_UUID, 7, CharProperties::WRITE)],
        );

        assert_eq!(catalog.find("2a19").map(|c| c.handle), Some(3));
        assert_eq!(
            catalog
                .find("da9e0002-0000-1000-8000-00805f9b34fb")
                .map(|c| c.handle),
            Some(7)
        );
        assert!(catalog.find("2a29").is_none());
        assert_eq!(
            catalog.get(CharacteristicRole::BatteryLevel).map(|c| c.handle),
            Some(3)
        );
    }

    #[test]
    fn test_ready_requires_command_and_stream() {
        let mut catalog = ServiceCatalog::new();
        catalog.insert_service(
            service(1),
            vec![characteristic(COMMAND_UUID, 1, CharProperties::WRITE)],
        );
        assert!(!catalog.is_ready());
        assert_eq!(
            catalog.missing_required(),
            vec![CharacteristicRole::DataStream]
        );

        catalog.insert_service(
            service(2),
            vec![characteristic(DATA_STREAM_UUID, 2, CharProperties::NOTIFY)],
        );
        assert!(catalog.is_ready());
        assert_eq!(catalog.service_count(), 2);
        assert_eq!(catalog.characteristic_count(), 2);

        catalog.clear();
        assert!(!catalog.is_ready());
        assert!(catalog.find(COMMAND_UUID).is_none());
    }

    #[test]
    fn test_notifying_set_dedup_and_removal_at_front() {
        let stream = characteristic(DATA_STREAM_UUID, 2, CharProperties::NOTIFY);
        let other = characteristic(COMMAND_UUID, 1, CharProperties::NOTIFY);
        let mut set = NotifyingSet::new();

        assert!(set.insert(stream.clone()));
        assert!(!set.insert(stream.clone()));
        assert!(set.insert(other.clone()));
        assert_eq!(set.len(), 2);

        // The first entry must be removable
        assert!(set.remove(&stream));
        assert!(!set.contains(&stream));
        assert!(!set.remove(&stream));
        assert_eq!(set.drain(), vec![other]);
        assert!(set.is_empty());
    }
}
