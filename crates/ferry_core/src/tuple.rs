//! Relationship tuples and their key decomposition.
//!
//! A tuple is `(user, relation, object[, condition])`. Users are written
//! `type:id` or `type:id#relation` (usersets); objects are `type:id`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{FerryError, FerryResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl Condition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: Map::new(),
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    pub user: String,
    pub relation: String,
    pub object: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

/// `type:id[#relation]` split into parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRef {
    pub user_type: String,
    pub user_id: String,
    pub user_relation: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    pub object_type: String,
    pub object_id: String,
}

impl Tuple {
    pub fn new(
        user: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            relation: relation.into(),
            object: object.into(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Assemble a tuple from decomposed key parts, as found in CSV rows.
    pub fn from_parts(
        user: UserRef,
        relation: impl Into<String>,
        object: ObjectRef,
        condition: Option<Condition>,
    ) -> Self {
        let user = match user.user_relation {
            Some(rel) if !rel.is_empty() => {
                format!("{}:{}#{}", user.user_type, user.user_id, rel)
            }
            _ => format!("{}:{}", user.user_type, user.user_id),
        };
        Self {
            user,
            relation: relation.into(),
            object: format!("{}:{}", object.object_type, object.object_id),
            condition,
        }
    }

    pub fn user_ref(&self) -> FerryResult<UserRef> {
        let (user_type, rest) = split_typed(&self.user, "user")?;
        let (user_id, user_relation) = match rest.split_once('#') {
            Some((id, rel)) => {
                check_token(rel, "user relation", &self.user)?;
                (id, Some(rel.to_string()))
            }
            None => (rest, None),
        };
        check_token(user_id, "user id", &self.user)?;
        Ok(UserRef {
            user_type: user_type.to_string(),
            user_id: user_id.to_string(),
            user_relation,
        })
    }

    pub fn object_ref(&self) -> FerryResult<ObjectRef> {
        let (object_type, object_id) = split_typed(&self.object, "object")?;
        if object_id.contains('#') {
            return Err(FerryError::validation(format!(
                "object '{}' must not carry a relation",
                self.object
            )));
        }
        check_token(object_id, "object id", &self.object)?;
        Ok(ObjectRef {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
        })
    }

    /// Structural check run before any tuple reaches the ledger or a client.
    pub fn validate(&self) -> FerryResult<()> {
        self.user_ref()?;
        self.object_ref()?;
        if self.relation.contains([':', '#']) {
            return Err(FerryError::validation(format!(
                "relation '{}' must not contain ':' or '#'",
                self.relation
            )));
        }
        check_token(&self.relation, "relation", &self.relation)?;
        if let Some(condition) = &self.condition {
            check_token(&condition.name, "condition name", &self.to_string())?;
        }
        Ok(())
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.object, self.relation, self.user)?;
        if let Some(condition) = &self.condition {
            write!(f, " [{}]", condition.name)?;
        }
        Ok(())
    }
}

/// Validate every tuple, reporting the first offender with its position.
pub fn validate_all(tuples: &[Tuple]) -> FerryResult<()> {
    for (index, tuple) in tuples.iter().enumerate() {
        tuple.validate().map_err(|err| {
            FerryError::validation(format!("tuple {}: {}", index + 1, err.message()))
        })?;
    }
    Ok(())
}

fn split_typed<'a>(value: &'a str, what: &str) -> FerryResult<(&'a str, &'a str)> {
    let Some((kind, rest)) = value.split_once(':') else {
        return Err(FerryError::validation(format!(
            "{what} '{value}' must be of the form type:id"
        )));
    };
    check_token(kind, &format!("{what} type"), value)?;
    Ok((kind, rest))
}

fn check_token(token: &str, what: &str, context: &str) -> FerryResult<()> {
    if token.is_empty() {
        return Err(FerryError::validation(format!("{what} is empty in '{context}'")));
    }
    if token.chars().any(char::is_whitespace) {
        return Err(FerryError::validation(format!(
            "{what} contains whitespace in '{context}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Condition, ObjectRef, Tuple, UserRef, validate_all};
    use serde_json::json;

    #[test]
    fn splits_userset_and_object() {
        let tuple = Tuple::new("group:eng#member", "viewer", "document:roadmap");
        let user = tuple.user_ref().expect("user");
        assert_eq!(user.user_type, "group");
        assert_eq!(user.user_id, "eng");
        assert_eq!(user.user_relation.as_deref(), Some("member"));
        let object = tuple.object_ref().expect("object");
        assert_eq!(object.object_type, "document");
        assert_eq!(object.object_id, "roadmap");
    }

    #[test]
    fn from_parts_rebuilds_strings() {
        let tuple = Tuple::from_parts(
            UserRef {
                user_type: "user".into(),
                user_id: "*".into(),
                user_relation: None,
            },
            "viewer",
            ObjectRef {
                object_type: "doc".into(),
                object_id: "1".into(),
            },
            None,
        );
        assert_eq!(tuple, Tuple::new("user:*", "viewer", "doc:1"));
    }

    #[test]
    fn rejects_malformed_tuples() {
        assert!(Tuple::new("anne", "viewer", "doc:1").validate().is_err());
        assert!(Tuple::new("user:anne", "", "doc:1").validate().is_err());
        assert!(Tuple::new("user:anne", "viewer", "doc:").validate().is_err());
        assert!(Tuple::new("user:anne", "view er", "doc:1").validate().is_err());
        assert!(Tuple::new("user:anne", "viewer", "doc:1#owner").validate().is_err());
    }

    #[test]
    fn validate_all_names_position() {
        let tuples = vec![
            Tuple::new("user:anne", "viewer", "doc:1"),
            Tuple::new("user:bob", "viewer", "doc"),
        ];
        let err = validate_all(&tuples).expect_err("second tuple is invalid");
        assert!(err.message().starts_with("tuple 2:"));
    }

    #[test]
    fn condition_serializes_context_when_present() {
        let context = json!({ "ip": "10.0.0.1" });
        let tuple = Tuple::new("user:anne", "viewer", "doc:1").with_condition(
            Condition::new("in_network").with_context(context.as_object().cloned().unwrap()),
        );
        let encoded = serde_json::to_value(&tuple).expect("encode");
        assert_eq!(encoded["condition"]["context"]["ip"], "10.0.0.1");
        let bare = serde_json::to_value(Tuple::new("user:anne", "viewer", "doc:1")).unwrap();
        assert!(bare.get("condition").is_none());
    }
}
