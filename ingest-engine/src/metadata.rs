use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

use crate::error::{IngestError, Result};

/// Reserved row identity column.
pub const D3M_INDEX_NAME: &str = "d3mIndex";

pub const INDEX_TYPE: &str = "index";
pub const INTEGER_TYPE: &str = "integer";
pub const FLOAT_TYPE: &str = "float";
pub const BOOL_TYPE: &str = "boolean";
pub const CATEGORICAL_TYPE: &str = "categorical";
pub const ORDINAL_TYPE: &str = "ordinal";
pub const TEXT_TYPE: &str = "text";
pub const STRING_TYPE: &str = "string";
pub const DATETIME_TYPE: &str = "dateTime";
pub const UNKNOWN_TYPE: &str = "unknown";
pub const REAL_VECTOR_TYPE: &str = "realVector";
pub const LATITUDE_TYPE: &str = "latitude";
pub const LONGITUDE_TYPE: &str = "longitude";
pub const ADDRESS_TYPE: &str = "address";
pub const CITY_TYPE: &str = "city";
pub const STATE_TYPE: &str = "state";
pub const COUNTRY_TYPE: &str = "country";
pub const COUNTRY_CODE_TYPE: &str = "country_code";
pub const POSTAL_CODE_TYPE: &str = "postal_code";
pub const EMAIL_TYPE: &str = "email";
pub const PHONE_TYPE: &str = "phone";
pub const URI_TYPE: &str = "uri";
pub const IMAGE_TYPE: &str = "image";
pub const TIMESERIES_TYPE: &str = "timeseries";

pub const ROLE_ATTRIBUTE: &str = "attribute";
pub const ROLE_INDEX: &str = "index";
pub const ROLE_TARGET: &str = "target";
pub const ROLE_SUGGESTED_TARGET: &str = "suggestedTarget";
pub const ROLE_MULTI_INDEX: &str = "multiIndex";

pub const PROVENANCE_SIMON: &str = "simon";
pub const PROVENANCE_SCHEMA: &str = "schema";

/// Probability assigned to schema-declared types so they dominate classifier output.
pub const SCHEMA_PROBABILITY: f64 = 2.0;

/// Minimum probability for a classifier suggestion to become the variable type.
pub const TYPE_PROBABILITY_THRESHOLD: f64 = 0.8;

pub const DEFAULT_RESOURCE_ID: &str = "learningData";
pub const DEFAULT_DATA_PATH: &str = "tables/learningData.csv";
pub const SCHEMA_FILE_NAME: &str = "datasetDoc.json";

pub const CLUSTER_PREFIX: &str = "_cluster_";
pub const FEATURE_PREFIX: &str = "_feature_";
pub const LAT_PREFIX: &str = "_lat_";
pub const LON_PREFIX: &str = "_lon_";

/// Location subtypes that make a variable eligible for geocoding.
pub const LOCATION_TYPES: &[&str] = &[
    ADDRESS_TYPE,
    CITY_TYPE,
    COUNTRY_TYPE,
    COUNTRY_CODE_TYPE,
    POSTAL_CODE_TYPE,
    STATE_TYPE,
    "location",
];

static NON_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9_]+").expect("static regex"));
static UNDERSCORE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_{2,}").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Table,
    Timeseries,
    Image,
    Audio,
    Text,
    Raw,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Table => "table",
            ResourceType::Timeseries => "timeseries",
            ResourceType::Image => "image",
            ResourceType::Audio => "audio",
            ResourceType::Text => "text",
            ResourceType::Raw => "raw",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "table" => Ok(ResourceType::Table),
            "timeseries" => Ok(ResourceType::Timeseries),
            "image" => Ok(ResourceType::Image),
            "audio" => Ok(ResourceType::Audio),
            "text" => Ok(ResourceType::Text),
            "raw" => Ok(ResourceType::Raw),
            other => Err(IngestError::schema(format!(
                "unrecognized resource type '{}'",
                other
            ))),
        }
    }

    /// Only tables are single files; every other resource is a directory.
    pub fn is_collection(&self) -> bool {
        !matches!(self, ResourceType::Table)
    }

    /// Default media type used when a schema lists bare extensions.
    pub fn default_media_type(&self) -> &'static str {
        match self {
            ResourceType::Table | ResourceType::Timeseries | ResourceType::Raw => "text/csv",
            ResourceType::Image => "image/jpeg",
            ResourceType::Audio => "audio/wav",
            ResourceType::Text => "text/plain",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistilRole {
    #[default]
    Data,
    Metadata,
    Index,
    Grouping,
}

impl DistilRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistilRole::Data => "data",
            DistilRole::Metadata => "metadata",
            DistilRole::Index => "index",
            DistilRole::Grouping => "grouping",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaSource {
    #[default]
    Original,
    Merged,
    Raw,
    Classification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedType {
    #[serde(rename = "type")]
    pub type_name: String,
    pub probability: f64,
    pub provenance: String,
}

impl SuggestedType {
    pub fn new(type_name: impl Into<String>, probability: f64, provenance: &str) -> Self {
        Self {
            type_name: type_name.into(),
            probability,
            provenance: provenance.to_string(),
        }
    }
}

/// Target of a `refersTo` link: a column name or a structured locator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResObject {
    Name(String),
    Fields(BTreeMap<String, serde_json::Value>),
}

/// Weak reference from a variable into another data resource. Resolved
/// through [`Metadata::resource`], never followed when serializing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRef {
    #[serde(rename = "resID")]
    pub res_id: String,
    #[serde(rename = "resObject")]
    pub res_object: ResObject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub index: usize,
    pub name: String,
    pub display_name: String,
    pub original_name: String,
    pub original_type: String,
    pub type_name: String,
    pub description: String,
    pub roles: Vec<String>,
    pub distil_role: DistilRole,
    pub refers_to: Option<VariableRef>,
    pub importance: Option<i64>,
    pub suggested_types: Vec<SuggestedType>,
}

impl Variable {
    pub fn new(index: usize, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let name = name.into();
        let type_name = type_name.into();
        Self {
            index,
            display_name: name.clone(),
            original_name: name.clone(),
            original_type: type_name.clone(),
            name,
            type_name,
            description: String::new(),
            roles: vec![ROLE_ATTRIBUTE.to_string()],
            distil_role: DistilRole::Data,
            refers_to: None,
            importance: None,
            suggested_types: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_distil_role(mut self, role: DistilRole) -> Self {
        self.distil_role = role;
        self
    }

    /// Names starting with `_` are metadata-only columns added by a step.
    pub fn is_augmentation(&self) -> bool {
        self.name.starts_with('_')
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Sorts suggestions by descending probability and derives `type_name`
    /// from the best one.
    pub fn apply_suggested_types(&mut self, mut suggested: Vec<SuggestedType>, threshold: f64) {
        suggested.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        self.type_name = match suggested.first() {
            Some(best) if best.probability >= threshold => best.type_name.clone(),
            Some(_) => TEXT_TYPE.to_string(),
            None => self.type_name.clone(),
        };
        self.suggested_types = suggested;
    }

    pub fn suggests_any(&self, types: &[&str]) -> bool {
        self.suggested_types
            .iter()
            .any(|s| types.contains(&s.type_name.as_str()))
            || types.contains(&self.type_name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataResource {
    pub res_id: String,
    pub res_path: String,
    pub res_type: ResourceType,
    pub res_format: BTreeMap<String, Vec<String>>,
    pub is_collection: bool,
    pub variables: Vec<Variable>,
}

impl DataResource {
    pub fn new(res_id: impl Into<String>, res_path: impl Into<String>, res_type: ResourceType) -> Self {
        let mut res_format = BTreeMap::new();
        res_format.insert(
            res_type.default_media_type().to_string(),
            vec![default_extension(res_type).to_string()],
        );
        Self {
            res_id: res_id.into(),
            res_path: res_path.into(),
            res_type,
            res_format,
            is_collection: res_type.is_collection(),
            variables: Vec::new(),
        }
    }

    /// Appends a variable at the next free index and returns that index.
    pub fn push_variable(&mut self, mut variable: Variable) -> usize {
        let index = self.variables.len();
        variable.index = index;
        self.variables.push(variable);
        index
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn variable_mut(&mut self, name: &str) -> Option<&mut Variable> {
        self.variables.iter_mut().find(|v| v.name == name)
    }

    pub fn has_d3m_index(&self) -> bool {
        self.variable(D3M_INDEX_NAME).is_some()
    }

    /// Variables ordered by column position.
    pub fn ordered_variables(&self) -> Vec<&Variable> {
        let mut ordered: Vec<&Variable> = self.variables.iter().collect();
        ordered.sort_by_key(|v| v.index);
        ordered
    }

    /// Expected CSV header for this resource.
    pub fn header(&self) -> Vec<String> {
        self.ordered_variables()
            .into_iter()
            .map(|v| v.name.clone())
            .collect()
    }

    /// Sorts by index and renumbers densely from zero.
    pub fn reindex(&mut self) {
        self.variables.sort_by_key(|v| v.index);
        for (i, v) in self.variables.iter_mut().enumerate() {
            v.index = i;
        }
    }
}

fn default_extension(res_type: ResourceType) -> &'static str {
    match res_type {
        ResourceType::Table | ResourceType::Timeseries | ResourceType::Raw => "csv",
        ResourceType::Image => "jpg",
        ResourceType::Audio => "wav",
        ResourceType::Text => "txt",
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Metadata {
    pub id: String,
    pub name: String,
    pub storage_name: String,
    pub description: String,
    pub summary: String,
    pub machine_summary: String,
    pub raw: bool,
    pub redacted: bool,
    pub parent_ids: Vec<String>,
    pub schema_source: SchemaSource,
    pub num_rows: i64,
    pub num_bytes: i64,
    pub dataset_folder: String,
    pub data_resources: Vec<DataResource>,
}

impl Metadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            storage_name: storage_name(&id),
            id,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn resource(&self, res_id: &str) -> Option<&DataResource> {
        self.data_resources.iter().find(|r| r.res_id == res_id)
    }

    pub fn resources_by_id(&self) -> HashMap<&str, &DataResource> {
        self.data_resources
            .iter()
            .map(|r| (r.res_id.as_str(), r))
            .collect()
    }

    fn main_position(&self) -> Option<usize> {
        self.data_resources
            .iter()
            .position(|r| r.has_d3m_index())
            .or_else(|| {
                self.data_resources
                    .iter()
                    .position(|r| r.res_type == ResourceType::Table)
            })
            .or_else(|| {
                self.data_resources
                    .iter()
                    .position(|r| !r.variables.is_empty())
            })
    }

    /// The resource holding the row index column (or the first table when
    /// the index has not been added yet).
    pub fn main_resource(&self) -> Result<&DataResource> {
        self.main_position()
            .map(|i| &self.data_resources[i])
            .ok_or_else(|| IngestError::schema(format!("dataset {} has no main data resource", self.id)))
    }

    pub fn main_resource_mut(&mut self) -> Result<&mut DataResource> {
        match self.main_position() {
            Some(i) => Ok(&mut self.data_resources[i]),
            None => Err(IngestError::schema(format!(
                "dataset {} has no main data resource",
                self.id
            ))),
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(
            self.schema_source,
            SchemaSource::Merged | SchemaSource::Classification
        ) && self.data_resources.len() == 1
    }

    /// Checks the structural invariants: dense variable indices, resolvable
    /// references, collection flags and a single main resource.
    pub fn validate(&self) -> Result<()> {
        let ids: HashSet<&str> = self.data_resources.iter().map(|r| r.res_id.as_str()).collect();
        let mut main_count = 0;

        for resource in &self.data_resources {
            if resource.is_collection != resource.res_type.is_collection() {
                return Err(IngestError::schema(format!(
                    "resource {} of type {} has isCollection={}",
                    resource.res_id, resource.res_type, resource.is_collection
                )));
            }
            if resource.has_d3m_index() {
                main_count += 1;
            }

            let mut seen = vec![false; resource.variables.len()];
            for variable in &resource.variables {
                match seen.get_mut(variable.index) {
                    Some(slot) if !*slot => *slot = true,
                    _ => {
                        return Err(IngestError::schema(format!(
                            "resource {} has invalid or duplicate index {} for {}",
                            resource.res_id, variable.index, variable.name
                        )))
                    }
                }
                if let Some(reference) = &variable.refers_to {
                    if !ids.contains(reference.res_id.as_str()) {
                        return Err(IngestError::schema(format!(
                            "variable {} refers to unknown resource {}",
                            variable.name, reference.res_id
                        )));
                    }
                }
            }
        }

        if main_count > 1 {
            return Err(IngestError::schema(format!(
                "dataset {} has {} resources carrying {}",
                self.id, main_count, D3M_INDEX_NAME
            )));
        }
        Ok(())
    }
}

/// Normalizes a dataset id into a relational table name.
pub fn storage_name(id: &str) -> String {
    normalize_identifier(id)
}

fn normalize_identifier(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let replaced = NON_IDENTIFIER.replace_all(&lowered, "_");
    UNDERSCORE_RUN.replace_all(&replaced, "_").into_owned()
}

/// Produces unique, normalized variable names for one resource.
#[derive(Debug, Default)]
pub struct NameNormalizer {
    enabled: bool,
    used: HashSet<String>,
}

impl NameNormalizer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            used: HashSet::new(),
        }
    }

    pub fn normalize(&mut self, raw: &str) -> String {
        if !self.enabled {
            self.used.insert(raw.to_string());
            return raw.to_string();
        }
        let base = if raw == D3M_INDEX_NAME {
            raw.to_string()
        } else {
            normalize_identifier(raw)
        };

        let mut candidate = base.clone();
        let mut suffix = 2;
        while self.used.contains(&candidate) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        self.used.insert(candidate.clone());
        candidate
    }
}
