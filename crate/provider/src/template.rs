//! Attribute templates applied to the objects created on the token.

use std::{collections::BTreeMap, sync::RwLock};

use serde::{Deserialize, Serialize};
use tokenbridge_interfaces::{Attribute, BooleanAttribute, KeyType, ObjectClass};
use tracing::trace;

/// The operations creating objects on the token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateOperation {
    Generate,
    Import,
    Unwrap,
}

/// Attribute values to apply to the objects matching the selectors.
///
/// A selector left to `None` matches any value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplateEntry {
    pub operation: Option<TemplateOperation>,
    pub class: Option<ObjectClass>,
    pub key_type: Option<KeyType>,
    pub values: BTreeMap<BooleanAttribute, bool>,
}

impl TemplateEntry {
    fn matches(&self, operation: TemplateOperation, class: ObjectClass, key_type: KeyType) -> bool {
        self.operation.is_none_or(|o| o == operation)
            && self.class.is_none_or(|c| c == class)
            && self.key_type.is_none_or(|k| k == key_type)
    }

    fn specificity(&self) -> usize {
        usize::from(self.operation.is_some())
            + usize::from(self.class.is_some())
            + usize::from(self.key_type.is_some())
    }
}

/// Resolves the attributes of the objects created on the token
#[derive(Debug, Default)]
pub struct TemplateManager {
    entries: RwLock<Vec<TemplateEntry>>,
}

impl TemplateManager {
    #[must_use]
    pub fn new(entries: Vec<TemplateEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn add(&self, entry: TemplateEntry) {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(entry);
    }

    /// Compute the final attributes of an object.
    ///
    /// Matching entries are applied from the least to the most specific one, and the configured
    /// values override the `requested` attributes.
    #[must_use]
    pub fn resolve(
        &self,
        operation: TemplateOperation,
        class: ObjectClass,
        key_type: KeyType,
        requested: Vec<Attribute>,
    ) -> Vec<Attribute> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut matching: Vec<&TemplateEntry> = entries
            .iter()
            .filter(|entry| entry.matches(operation, class, key_type))
            .collect();
        matching.sort_by_key(|entry| entry.specificity());

        let mut attributes = requested;
        for (attribute, value) in matching.iter().flat_map(|entry| entry.values.iter()) {
            let attribute = attribute.with_value(*value);
            match attributes
                .iter_mut()
                .find(|a| a.attribute_type() == attribute.attribute_type())
            {
                Some(existing) => *existing = attribute,
                None => attributes.push(attribute),
            }
        }
        trace!("{operation:?} {class:?} {key_type:?}: {attributes:?}");
        attributes
    }
}

#[cfg(test)]
mod tests {
    use tokenbridge_interfaces::{
        Attribute, AttributeList, AttributeType, BooleanAttribute, KeyType, ObjectClass,
    };

    use super::{TemplateEntry, TemplateManager, TemplateOperation};

    fn entry(
        operation: Option<TemplateOperation>,
        class: Option<ObjectClass>,
        key_type: Option<KeyType>,
        values: &[(BooleanAttribute, bool)],
    ) -> TemplateEntry {
        TemplateEntry {
            operation,
            class,
            key_type,
            values: values.iter().copied().collect(),
        }
    }

    #[test]
    fn test_most_specific_entry_wins() {
        let manager = TemplateManager::new(vec![
            entry(
                Some(TemplateOperation::Generate),
                Some(ObjectClass::SecretKey),
                Some(KeyType::Aes),
                &[(BooleanAttribute::Sensitive, false)],
            ),
            entry(None, None, None, &[(BooleanAttribute::Sensitive, true)]),
            entry(
                Some(TemplateOperation::Generate),
                None,
                None,
                &[(BooleanAttribute::Extractable, false)],
            ),
        ]);
        let attributes = manager.resolve(
            TemplateOperation::Generate,
            ObjectClass::SecretKey,
            KeyType::Aes,
            vec![Attribute::Token(false), Attribute::Extractable(true)],
        );
        assert_eq!(attributes.bool_value(AttributeType::Sensitive), Some(false));
        assert_eq!(attributes.bool_value(AttributeType::Extractable), Some(false));
        assert_eq!(attributes.bool_value(AttributeType::Token), Some(false));

        // only the wildcard entry applies to imported DES keys
        let attributes = manager.resolve(
            TemplateOperation::Import,
            ObjectClass::SecretKey,
            KeyType::Des,
            vec![Attribute::Extractable(true)],
        );
        assert_eq!(
            attributes,
            vec![Attribute::Extractable(true), Attribute::Sensitive(true)]
        );
    }

    #[test]
    fn test_added_entry() {
        let manager = TemplateManager::default();
        let requested = vec![Attribute::Token(false)];
        assert_eq!(
            manager.resolve(
                TemplateOperation::Unwrap,
                ObjectClass::SecretKey,
                KeyType::GenericSecret,
                requested.clone(),
            ),
            requested
        );
        manager.add(entry(
            Some(TemplateOperation::Unwrap),
            None,
            None,
            &[(BooleanAttribute::Token, true)],
        ));
        assert_eq!(
            manager.resolve(
                TemplateOperation::Unwrap,
                ObjectClass::SecretKey,
                KeyType::GenericSecret,
                requested,
            ),
            vec![Attribute::Token(true)]
        );
    }
}
