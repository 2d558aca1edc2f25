// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Data Transfer Objects
//!
//! A dispatch entry may declare a [`Schema`]: a fixed rule set validated
//! against the inbound `params` before the handler runs. Validation either
//! yields a [`Dto`] — a read-only projection of exactly the declared fields —
//! or the full set of per-field errors. A partially-built DTO never exists;
//! handlers only ever see params that passed every rule.

use crate::errors::FieldErrors;
use serde_json::{Map, Value};

/// Expected JSON type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Any,
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::Any => true,
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::Any => "any",
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
        }
    }
}

/// A single validation rule for one field.
#[derive(Debug, Clone)]
pub struct Rule {
    field: String,
    required: bool,
    kind: FieldKind,
}

impl Rule {
    pub fn required(field: &str) -> Rule {
        Rule {
            field: field.to_owned(),
            required: true,
            kind: FieldKind::Any,
        }
    }

    pub fn optional(field: &str) -> Rule {
        Rule {
            field: field.to_owned(),
            required: false,
            kind: FieldKind::Any,
        }
    }

    pub fn string(mut self) -> Self {
        self.kind = FieldKind::String;
        self
    }

    pub fn integer(mut self) -> Self {
        self.kind = FieldKind::Integer;
        self
    }

    pub fn number(mut self) -> Self {
        self.kind = FieldKind::Number;
        self
    }

    pub fn boolean(mut self) -> Self {
        self.kind = FieldKind::Boolean;
        self
    }

    pub fn array(mut self) -> Self {
        self.kind = FieldKind::Array;
        self
    }

    pub fn object(mut self) -> Self {
        self.kind = FieldKind::Object;
        self
    }
}

/// The validation rule set of one dispatch entry, fixed at registration.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    rules: Vec<Rule>,
}

impl Schema {
    pub fn new(rules: Vec<Rule>) -> Schema {
        Schema { rules }
    }

    /// Validates `params` against every rule, collecting all field errors.
    ///
    /// On success the returned DTO carries only the declared fields, in the
    /// manner of the `only()` projection.
    pub fn validate(&self, params: &Value) -> Result<Dto, FieldErrors> {
        let mut errors = FieldErrors::new();

        let Some(object) = params.as_object() else {
            errors.insert(
                "params".to_owned(),
                vec!["the params must be an object".to_owned()],
            );
            return Err(errors);
        };

        let mut fields = Map::new();
        for rule in &self.rules {
            match object.get(&rule.field) {
                None | Some(Value::Null) => {
                    if rule.required {
                        errors
                            .entry(rule.field.clone())
                            .or_default()
                            .push(format!("the {} field is required", rule.field));
                    }
                }
                Some(value) => {
                    if rule.kind.accepts(value) {
                        fields.insert(rule.field.clone(), value.clone());
                    } else {
                        errors.entry(rule.field.clone()).or_default().push(format!(
                            "the {} field must be of type {}",
                            rule.field,
                            rule.kind.name()
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(Dto { fields })
        } else {
            Err(errors)
        }
    }
}

/// A validated, read-only projection of inbound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Dto {
    fields: Map<String, Value>,
}

impl Dto {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn is_null(&self, field: &str) -> bool {
        self.fields.get(field).is_none()
    }

    /// The public projection handed to handlers and serialized back out.
    pub fn only(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product_schema() -> Schema {
        Schema::new(vec![
            Rule::required("id").integer(),
            Rule::required("name").string(),
            Rule::optional("tags").array(),
        ])
    }

    #[test]
    fn valid_params_build_a_projection_of_declared_fields_only() {
        let dto = product_schema()
            .validate(&json!({"id": 1, "name": "A", "price": 9.5}))
            .unwrap();

        assert_eq!(dto.only(), json!({"id": 1, "name": "A"}));
        assert_eq!(dto.get("id"), Some(&json!(1)));
        assert!(dto.is_null("price"));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let errors = product_schema()
            .validate(&json!({"name": "A"}))
            .unwrap_err();

        assert_eq!(errors["id"], vec!["the id field is required"]);
        assert!(!errors.contains_key("name"));
    }

    #[test]
    fn type_mismatches_are_collected_per_field() {
        let errors = product_schema()
            .validate(&json!({"id": "one", "name": 42}))
            .unwrap_err();

        assert_eq!(errors["id"], vec!["the id field must be of type integer"]);
        assert_eq!(errors["name"], vec!["the name field must be of type string"]);
    }

    #[test]
    fn optional_fields_may_be_absent_but_not_mistyped() {
        assert!(product_schema()
            .validate(&json!({"id": 1, "name": "A"}))
            .is_ok());

        let errors = product_schema()
            .validate(&json!({"id": 1, "name": "A", "tags": "x"}))
            .unwrap_err();
        assert_eq!(errors["tags"], vec!["the tags field must be of type array"]);
    }

    #[test]
    fn non_object_params_are_rejected_outright() {
        let errors = product_schema().validate(&json!([1, 2])).unwrap_err();

        assert_eq!(errors["params"], vec!["the params must be an object"]);
    }

    #[test]
    fn explicit_null_counts_as_missing() {
        let errors = product_schema()
            .validate(&json!({"id": null, "name": "A"}))
            .unwrap_err();

        assert_eq!(errors["id"], vec!["the id field is required"]);
    }

    #[test]
    fn empty_schema_accepts_anything_object_shaped() {
        let dto = Schema::default().validate(&json!({"whatever": 1})).unwrap();

        assert!(dto.is_empty());
        assert_eq!(dto.only(), json!({}));
    }
}
