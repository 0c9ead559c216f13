// Content objects as they are written to a publish target

use super::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of an external content store (one lock key per target)
pub type TargetKey = String;

/// A published object: type, id and its flattened attribute values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentObject {
    pub obj_type: i32,
    pub obj_id: u64,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl ContentObject {
    pub fn new(obj_type: i32, obj_id: u64) -> Self {
        Self {
            obj_type,
            obj_id,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Content id in `<type>.<id>` notation, the primary key in the store
    pub fn content_id(&self) -> String {
        format!("{}.{}", self.obj_type, self.obj_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.obj_type <= 0 {
            return Err(DomainError::InvalidObjectType(self.obj_type));
        }
        if self.obj_id == 0 {
            return Err(DomainError::InvalidContentId(self.content_id()));
        }
        if let Some(name) = self.attributes.keys().find(|name| name.trim().is_empty()) {
            return Err(DomainError::ValidationError(format!(
                "attribute name {:?} of {} is blank",
                name,
                self.content_id()
            )));
        }
        Ok(())
    }

    /// Names of attributes that differ from `previous` (added, removed or changed)
    pub fn changed_attributes(&self, previous: &ContentObject) -> Vec<String> {
        let mut changed: Vec<String> = self
            .attributes
            .iter()
            .filter(|(name, value)| previous.attributes.get(*name) != Some(*value))
            .map(|(name, _)| name.clone())
            .collect();
        changed.extend(
            previous
                .attributes
                .keys()
                .filter(|name| !self.attributes.contains_key(*name))
                .cloned(),
        );
        changed.sort();
        changed
    }
}

/// One write against a publish target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PublishOp {
    Create {
        object: ContentObject,
    },
    Update {
        object: ContentObject,
        #[serde(default)]
        previous: Option<ContentObject>,
        #[serde(default)]
        changed: Vec<String>,
    },
    Delete {
        object: ContentObject,
    },
}

impl PublishOp {
    pub fn object(&self) -> &ContentObject {
        match self {
            PublishOp::Create { object }
            | PublishOp::Update { object, .. }
            | PublishOp::Delete { object } => object,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PublishOp::Create { .. } => "create",
            PublishOp::Update { .. } => "update",
            PublishOp::Delete { .. } => "delete",
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.object().validate()?;
        if let PublishOp::Update {
            object,
            previous: Some(previous),
            ..
        } = self
        {
            if previous.content_id() != object.content_id() {
                return Err(DomainError::InvalidOperation(format!(
                    "update of {} carries previous version of {}",
                    object.content_id(),
                    previous.content_id()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_id_notation() {
        assert_eq!(ContentObject::new(10007, 42).content_id(), "10007.42");
    }

    #[test]
    fn test_validate_rejects_zero_id() {
        let result = ContentObject::new(10007, 0).validate();
        assert!(matches!(result, Err(DomainError::InvalidContentId(_))));
    }

    #[test]
    fn test_changed_attributes_covers_added_removed_and_modified() {
        let previous = ContentObject::new(10007, 1)
            .with_attribute("name", json!("old"))
            .with_attribute("gone", json!(1))
            .with_attribute("same", json!(true));
        let current = ContentObject::new(10007, 1)
            .with_attribute("name", json!("new"))
            .with_attribute("added", json!([1, 2]))
            .with_attribute("same", json!(true));

        assert_eq!(
            current.changed_attributes(&previous),
            vec!["added".to_string(), "gone".to_string(), "name".to_string()]
        );
    }

    #[test]
    fn test_publish_op_from_json() {
        let op: PublishOp = serde_json::from_value(json!({
            "op": "update",
            "object": {"obj_type": 10007, "obj_id": 5, "attributes": {"name": "x"}},
            "changed": ["name"]
        }))
        .unwrap();

        assert_eq!(op.kind(), "update");
        assert_eq!(op.object().content_id(), "10007.5");
        assert!(op.validate().is_ok());
    }

    #[test]
    fn test_update_with_foreign_previous_is_invalid() {
        let op = PublishOp::Update {
            object: ContentObject::new(10007, 1),
            previous: Some(ContentObject::new(10007, 2)),
            changed: vec![],
        };
        assert!(matches!(
            op.validate(),
            Err(DomainError::InvalidOperation(_))
        ));
    }
}
