//! Graph schema: the on-disk configuration document and its compiled form.
//!
//! The document is parsed with serde and validated into a [`Schema`] with
//! dense label ids. The schema is immutable after the graph opens.

use std::path::Path;

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::{GraphError, Result};
use crate::model::PropType;
use crate::types::{EdgeTypeId, LabelId, PropId};

/// `max_vertex_num` when the document omits it. Reservations are sized from
/// this hint, so the effective value is clamped to the 32-bit vid space.
pub const DEFAULT_MAX_VERTEX_NUM: u64 = 1 << 48;

const STORE_TYPE: &str = "mutable_csr";

/// Relation cardinality of one (source, destination) pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Relation {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Relation {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "ONE_TO_ONE" => Ok(Relation::OneToOne),
            "ONE_TO_MANY" => Ok(Relation::OneToMany),
            "MANY_TO_ONE" => Ok(Relation::ManyToOne),
            "MANY_TO_MANY" => Ok(Relation::ManyToMany),
            other => Err(GraphError::Schema(format!("unknown relation {other:?}"))),
        }
    }
}

/// Per-direction edge-storage policy of one triplet.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum EdgeStrategy {
    /// Edges in this direction are not stored.
    None,
    /// At most one record per source; a later insert overwrites it in place.
    Single,
    /// Growable insertion-ordered list per source.
    #[default]
    Multiple,
}

impl EdgeStrategy {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "None" => Ok(EdgeStrategy::None),
            "Single" => Ok(EdgeStrategy::Single),
            "Multiple" => Ok(EdgeStrategy::Multiple),
            other => Err(GraphError::Schema(format!(
                "unknown edge strategy {other:?}"
            ))),
        }
    }
}

/// One property column of a vertex label (or the single edge property).
#[derive(Clone, Debug)]
pub struct PropSpec {
    pub name: String,
    pub ty: PropType,
}

/// Compiled vertex label. Property 0 is the primary key (signed 64-bit).
#[derive(Clone, Debug)]
pub struct VertexLabel {
    pub name: String,
    pub props: Vec<PropSpec>,
    pub max_vertex_num: u32,
}

impl VertexLabel {
    /// Looks up a property column by name.
    pub fn prop_id(&self, name: &str) -> Option<PropId> {
        self.props
            .iter()
            .position(|p| p.name == name)
            .map(|i| PropId(i as u32))
    }
}

/// One allowed (source label, destination label) pair of an edge label.
#[derive(Clone, Debug)]
pub struct TripletSpec {
    pub src: LabelId,
    pub dst: LabelId,
    pub relation: Relation,
    pub incoming: EdgeStrategy,
    pub outgoing: EdgeStrategy,
}

/// Compiled edge label with its allowed triplets and optional property.
#[derive(Clone, Debug)]
pub struct EdgeLabel {
    pub name: String,
    pub prop: Option<PropSpec>,
    pub triplets: Vec<TripletSpec>,
}

/// Immutable compiled schema of one graph instance.
#[derive(Debug)]
pub struct Schema {
    name: String,
    vertex_labels: Vec<VertexLabel>,
    edge_labels: Vec<EdgeLabel>,
    vertex_by_name: FxHashMap<String, LabelId>,
    edge_by_name: FxHashMap<String, EdgeTypeId>,
}

impl Schema {
    /// Parses and validates a schema document from a YAML string.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let doc: SchemaDoc = serde_yaml::from_str(text)
            .map_err(|e| GraphError::Schema(format!("malformed schema document: {e}")))?;
        Self::compile(doc)
    }

    /// Parses and validates a schema document from a file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Graph name from the document.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All vertex labels in id order.
    pub fn vertex_labels(&self) -> &[VertexLabel] {
        &self.vertex_labels
    }

    /// All edge labels in id order.
    pub fn edge_labels(&self) -> &[EdgeLabel] {
        &self.edge_labels
    }

    /// The vertex label for `id`.
    pub fn vertex_label(&self, id: LabelId) -> &VertexLabel {
        &self.vertex_labels[id.0 as usize]
    }

    /// The edge label for `id`.
    pub fn edge_label(&self, id: EdgeTypeId) -> &EdgeLabel {
        &self.edge_labels[id.0 as usize]
    }

    /// Resolves a vertex label name.
    pub fn label_id(&self, name: &str) -> Option<LabelId> {
        self.vertex_by_name.get(name).copied()
    }

    /// Resolves an edge label name.
    pub fn edge_type_id(&self, name: &str) -> Option<EdgeTypeId> {
        self.edge_by_name.get(name).copied()
    }

    fn compile(doc: SchemaDoc) -> Result<Self> {
        if doc.store_type != STORE_TYPE {
            return Err(GraphError::Schema(format!(
                "store_type must be {STORE_TYPE:?}, got {:?}",
                doc.store_type
            )));
        }
        let mut vertex_labels = Vec::with_capacity(doc.schema.vertex_types.len());
        let mut vertex_by_name = FxHashMap::default();
        for vt in &doc.schema.vertex_types {
            let props = compile_props(&vt.type_name, &vt.properties)?;
            if props.is_empty() {
                return Err(GraphError::Schema(format!(
                    "vertex type {:?} has no properties",
                    vt.type_name
                )));
            }
            if vt.primary_keys.len() != 1 {
                return Err(GraphError::Schema(format!(
                    "vertex type {:?} must declare exactly one primary key",
                    vt.type_name
                )));
            }
            if vt.primary_keys[0] != props[0].name {
                return Err(GraphError::Schema(format!(
                    "vertex type {:?}: primary key {:?} must be the first property",
                    vt.type_name, vt.primary_keys[0]
                )));
            }
            if props[0].ty != PropType::Int64 {
                return Err(GraphError::Schema(format!(
                    "vertex type {:?}: primary key must be DT_SIGNED_INT64",
                    vt.type_name
                )));
            }
            let max_vertex_num = vt.x_csr_params.max_vertex_num.min(u32::MAX as u64) as u32;
            if max_vertex_num == 0 {
                return Err(GraphError::Schema(format!(
                    "vertex type {:?}: max_vertex_num must be positive",
                    vt.type_name
                )));
            }
            let id = LabelId(vertex_labels.len() as u32);
            if vertex_by_name
                .insert(vt.type_name.clone(), id)
                .is_some()
            {
                return Err(GraphError::Schema(format!(
                    "duplicate vertex type {:?}",
                    vt.type_name
                )));
            }
            vertex_labels.push(VertexLabel {
                name: vt.type_name.clone(),
                props,
                max_vertex_num,
            });
        }

        let mut edge_labels = Vec::with_capacity(doc.schema.edge_types.len());
        let mut edge_by_name = FxHashMap::default();
        for et in &doc.schema.edge_types {
            if et.properties.len() > 1 {
                return Err(GraphError::Schema(format!(
                    "edge type {:?} may carry at most one property",
                    et.type_name
                )));
            }
            let prop = match et.properties.first() {
                Some(p) => {
                    let spec = PropSpec {
                        name: p.property_name.clone(),
                        ty: parse_primitive(&p.property_type.primitive_type)?,
                    };
                    if !spec.ty.is_fixed() {
                        return Err(GraphError::Schema(format!(
                            "edge type {:?}: property must be fixed-width, got {}",
                            et.type_name, spec.ty
                        )));
                    }
                    Some(spec)
                }
                None => None,
            };
            if et.vertex_type_pair_relations.is_empty() {
                return Err(GraphError::Schema(format!(
                    "edge type {:?} declares no vertex type pairs",
                    et.type_name
                )));
            }
            let mut triplets = Vec::with_capacity(et.vertex_type_pair_relations.len());
            for pair in &et.vertex_type_pair_relations {
                let src = *vertex_by_name.get(&pair.source_vertex).ok_or_else(|| {
                    GraphError::Schema(format!(
                        "edge type {:?}: unknown source vertex type {:?}",
                        et.type_name, pair.source_vertex
                    ))
                })?;
                let dst = *vertex_by_name
                    .get(&pair.destination_vertex)
                    .ok_or_else(|| {
                        GraphError::Schema(format!(
                            "edge type {:?}: unknown destination vertex type {:?}",
                            et.type_name, pair.destination_vertex
                        ))
                    })?;
                if triplets
                    .iter()
                    .any(|t: &TripletSpec| t.src == src && t.dst == dst)
                {
                    return Err(GraphError::Schema(format!(
                        "edge type {:?}: duplicate pair ({:?}, {:?})",
                        et.type_name, pair.source_vertex, pair.destination_vertex
                    )));
                }
                triplets.push(TripletSpec {
                    src,
                    dst,
                    relation: Relation::parse(&pair.relation)?,
                    incoming: EdgeStrategy::parse(&pair.x_csr_params.incoming_edge_strategy)?,
                    outgoing: EdgeStrategy::parse(&pair.x_csr_params.outgoing_edge_strategy)?,
                });
            }
            let id = EdgeTypeId(edge_labels.len() as u32);
            if edge_by_name.insert(et.type_name.clone(), id).is_some() {
                return Err(GraphError::Schema(format!(
                    "duplicate edge type {:?}",
                    et.type_name
                )));
            }
            edge_labels.push(EdgeLabel {
                name: et.type_name.clone(),
                prop,
                triplets,
            });
        }

        Ok(Schema {
            name: doc.name,
            vertex_labels,
            edge_labels,
            vertex_by_name,
            edge_by_name,
        })
    }
}

fn compile_props(type_name: &str, docs: &[PropertyDoc]) -> Result<Vec<PropSpec>> {
    let mut props = Vec::with_capacity(docs.len());
    for (idx, p) in docs.iter().enumerate() {
        if p.property_id as usize != idx {
            return Err(GraphError::Schema(format!(
                "vertex type {type_name:?}: property {:?} has id {} at position {idx}",
                p.property_name, p.property_id
            )));
        }
        props.push(PropSpec {
            name: p.property_name.clone(),
            ty: parse_primitive(&p.property_type.primitive_type)?,
        });
    }
    Ok(props)
}

fn parse_primitive(name: &str) -> Result<PropType> {
    match name {
        "DT_SIGNED_INT32" => Ok(PropType::Int32),
        "DT_SIGNED_INT64" => Ok(PropType::Int64),
        "DT_UNSIGNED_INT32" => Ok(PropType::UInt32),
        "DT_UNSIGNED_INT64" => Ok(PropType::UInt64),
        "DT_DOUBLE" => Ok(PropType::Double),
        "DT_BOOL" => Ok(PropType::Bool),
        "DT_DATE" => Ok(PropType::Date),
        "DT_DATETIME" => Ok(PropType::DateTime),
        "DT_STRING" => Ok(PropType::Str),
        other => Err(GraphError::Schema(format!(
            "unknown primitive type {other:?}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct SchemaDoc {
    name: String,
    store_type: String,
    /// Consumed by the plugin loader, not the core.
    #[serde(default)]
    #[allow(dead_code)]
    stored_procedures: serde_yaml::Value,
    schema: SchemaBody,
}

#[derive(Debug, Deserialize)]
struct SchemaBody {
    #[serde(default)]
    vertex_types: Vec<VertexTypeDoc>,
    #[serde(default)]
    edge_types: Vec<EdgeTypeDoc>,
}

#[derive(Debug, Deserialize)]
struct VertexTypeDoc {
    type_name: String,
    properties: Vec<PropertyDoc>,
    primary_keys: Vec<String>,
    #[serde(default)]
    x_csr_params: VertexCsrParams,
}

#[derive(Debug, Deserialize)]
struct PropertyDoc {
    property_id: u32,
    property_name: String,
    property_type: PropertyTypeDoc,
}

#[derive(Debug, Deserialize)]
struct PropertyTypeDoc {
    primitive_type: String,
}

#[derive(Debug, Deserialize)]
struct VertexCsrParams {
    #[serde(default = "default_max_vertex_num")]
    max_vertex_num: u64,
}

impl Default for VertexCsrParams {
    fn default() -> Self {
        Self {
            max_vertex_num: DEFAULT_MAX_VERTEX_NUM,
        }
    }
}

fn default_max_vertex_num() -> u64 {
    DEFAULT_MAX_VERTEX_NUM
}

#[derive(Debug, Deserialize)]
struct EdgeTypeDoc {
    type_name: String,
    #[serde(default)]
    properties: Vec<PropertyDoc>,
    vertex_type_pair_relations: Vec<PairRelationDoc>,
}

#[derive(Debug, Deserialize)]
struct PairRelationDoc {
    source_vertex: String,
    destination_vertex: String,
    relation: String,
    #[serde(default)]
    x_csr_params: EdgeCsrParams,
}

#[derive(Debug, Deserialize)]
struct EdgeCsrParams {
    #[serde(default = "default_strategy")]
    incoming_edge_strategy: String,
    #[serde(default = "default_strategy")]
    outgoing_edge_strategy: String,
}

impl Default for EdgeCsrParams {
    fn default() -> Self {
        Self {
            incoming_edge_strategy: default_strategy(),
            outgoing_edge_strategy: default_strategy(),
        }
    }
}

fn default_strategy() -> String {
    "Multiple".to_string()
}
