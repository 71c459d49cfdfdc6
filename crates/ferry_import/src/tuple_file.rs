use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ferry_core::{
    Condition, FerryError, FerryResult, ObjectRef, Tuple, UserRef, validate_all,
};

/// Column order of CSV tuple files, also used for CSV audit output.
pub const CSV_HEADERS: [&str; 8] = [
    "user_type",
    "user_id",
    "user_relation",
    "relation",
    "object_type",
    "object_id",
    "condition_name",
    "condition_context",
];

const REQUIRED_HEADERS: [&str; 5] = ["user_type", "user_id", "relation", "object_type", "object_id"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    /// A JSON array for input; one object per line for audit output.
    Json,
    Yaml,
    Csv,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> FerryResult<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "json" | "jsonl" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            "csv" => Ok(Self::Csv),
            _ => Err(FerryError::validation(format!(
                "unsupported file extension for {}; expected json, yaml or csv",
                path.display()
            ))),
        }
    }
}

/// One CSV row: a tuple with its keys split into columns.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TupleRecord {
    pub user_type: String,
    pub user_id: String,
    #[serde(default)]
    pub user_relation: Option<String>,
    pub relation: String,
    pub object_type: String,
    pub object_id: String,
    #[serde(default)]
    pub condition_name: Option<String>,
    /// JSON object text.
    #[serde(default)]
    pub condition_context: Option<String>,
}

impl TupleRecord {
    pub fn from_tuple(tuple: &Tuple) -> FerryResult<Self> {
        let user = tuple.user_ref()?;
        let object = tuple.object_ref()?;
        let (condition_name, condition_context) = match &tuple.condition {
            Some(condition) => {
                let context = if condition.context.is_empty() {
                    None
                } else {
                    Some(
                        serde_json::to_string(&condition.context).map_err(|err| {
                            FerryError::validation(format!("encode condition context: {err}"))
                        })?,
                    )
                };
                (Some(condition.name.clone()), context)
            }
            None => (None, None),
        };
        Ok(Self {
            user_type: user.user_type,
            user_id: user.user_id,
            user_relation: user.user_relation,
            relation: tuple.relation.clone(),
            object_type: object.object_type,
            object_id: object.object_id,
            condition_name,
            condition_context,
        })
    }

    pub fn into_tuple(self) -> FerryResult<Tuple> {
        let condition_name = non_empty(self.condition_name);
        let condition_context = non_empty(self.condition_context);
        let condition = match (condition_name, condition_context) {
            (Some(name), context) => {
                let context = match context {
                    Some(raw) => parse_context(&raw)?,
                    None => Map::new(),
                };
                Some(Condition::new(name).with_context(context))
            }
            (None, Some(_)) => {
                return Err(FerryError::validation(
                    "condition_context is set but condition_name is empty",
                ));
            }
            (None, None) => None,
        };
        Ok(Tuple::from_parts(
            UserRef {
                user_type: self.user_type,
                user_id: self.user_id,
                user_relation: non_empty(self.user_relation),
            },
            self.relation,
            ObjectRef {
                object_type: self.object_type,
                object_id: self.object_id,
            },
            condition,
        ))
    }
}

pub fn read_tuple_file(path: &Path) -> FerryResult<Vec<Tuple>> {
    let format = FileFormat::from_path(path)?;
    let raw = fs::read_to_string(path)
        .map_err(|err| FerryError::validation(format!("read {}: {err}", path.display())))?;
    let tuples = parse_tuples(&raw, format)?;
    log::info!("import: read {} tuples from {}", tuples.len(), path.display());
    Ok(tuples)
}

/// Parse and validate tuples. Any malformed entry rejects the whole input.
pub fn parse_tuples(raw: &str, format: FileFormat) -> FerryResult<Vec<Tuple>> {
    let tuples = match format {
        FileFormat::Json => serde_json::from_str::<Vec<Tuple>>(raw)
            .map_err(|err| FerryError::validation(format!("parse json tuples: {err}")))?,
        FileFormat::Yaml => serde_yaml::from_str::<Vec<Tuple>>(raw)
            .map_err(|err| FerryError::validation(format!("parse yaml tuples: {err}")))?,
        FileFormat::Csv => parse_csv(raw)?,
    };
    validate_all(&tuples)?;
    Ok(tuples)
}

fn parse_csv(raw: &str) -> FerryResult<Vec<Tuple>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());
    let headers = reader
        .headers()
        .map_err(|err| FerryError::validation(format!("read csv header: {err}")))?
        .clone();
    let has = |name: &str| headers.iter().any(|header| header == name);
    for required in REQUIRED_HEADERS {
        if !has(required) {
            return Err(FerryError::validation(format!(
                "csv header is missing required column {required}"
            )));
        }
    }
    if has("condition_context") && !has("condition_name") {
        return Err(FerryError::validation(
            "csv header has condition_context but is missing condition_name",
        ));
    }

    let mut tuples = Vec::new();
    for (index, record) in reader.deserialize::<TupleRecord>().enumerate() {
        // Line 1 is the header.
        let line = index + 2;
        let record = record
            .map_err(|err| FerryError::validation(format!("csv line {line}: {err}")))?;
        let tuple = record.into_tuple().map_err(|err| {
            FerryError::validation(format!("csv line {line}: {}", err.message()))
        })?;
        tuples.push(tuple);
    }
    Ok(tuples)
}

fn parse_context(raw: &str) -> FerryResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(FerryError::validation(
            "condition_context must be a JSON object",
        )),
        Err(err) => Err(FerryError::validation(format!(
            "condition_context is not valid JSON: {err}"
        ))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
