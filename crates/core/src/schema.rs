//! Canonical schema model and the normalizer that produces it.
//!
//! Raw stream schemas may use references, conjunctions (`allOf`),
//! disjunctions (`anyOf`/`oneOf`) and multi-kind `type` arrays. [`normalize`]
//! reduces all of that to a [`CanonicalSchema`]: either one [`Shape`] carrying
//! at most one non-null kind, or a disjoint list of such shapes.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::error::SchemaError;

/// String format that marks a timestamp.
pub const DATE_TIME_FORMAT: &str = "date-time";

const SUPPORTED_DRAFTS: &[&str] = &["draft-04", "draft-06", "draft-07"];

/// Structural kind of a JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    /// `null`
    Null,
    /// `true` / `false`
    Boolean,
    /// Whole numbers.
    Integer,
    /// Any number.
    Number,
    /// Strings, possibly refined by a format.
    String,
    /// Arrays.
    Array,
    /// Objects.
    Object,
}

impl Kind {
    /// Keyword spelling of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Null => "null",
            Kind::Boolean => "boolean",
            Kind::Integer => "integer",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::Array => "array",
            Kind::Object => "object",
        }
    }

    /// Parses a `type` keyword entry.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "null" => Kind::Null,
            "boolean" => Kind::Boolean,
            "integer" => Kind::Integer,
            "number" => Kind::Number,
            "string" => Kind::String,
            "array" => Kind::Array,
            "object" => Kind::Object,
            _ => return None,
        })
    }

    /// Kind of a concrete JSON value.
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Kind::Integer,
            Value::Number(_) => Kind::Number,
            Value::String(_) => Kind::String,
            Value::Array(_) => Kind::Array,
            Value::Object(_) => Kind::Object,
        }
    }

    /// Whether the kind is an object or array.
    pub fn is_container(self) -> bool {
        matches!(self, Kind::Array | Kind::Object)
    }

    fn accepts(self, value: &Value) -> bool {
        let actual = Kind::of_value(value);
        actual == self || (self == Kind::Number && actual == Kind::Integer)
    }
}

/// One structural alternative of a canonical schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shape {
    /// Kinds this shape admits; at most one besides `null` once normalized.
    pub types: BTreeSet<Kind>,
    /// Object properties (only when `Object` is admitted).
    pub properties: BTreeMap<String, CanonicalSchema>,
    /// Properties every object must carry (only when `Object` is admitted).
    pub required: BTreeSet<String>,
    /// Item schema (only when `Array` is admitted).
    pub items: Option<Box<CanonicalSchema>>,
    /// Format refinement (only when `String` is admitted).
    pub format: Option<String>,
    /// Declared default value.
    pub default: Option<Value>,
}

impl Shape {
    /// A shape admitting exactly `kind`.
    pub fn of_kind(kind: Kind) -> Self {
        Self {
            types: BTreeSet::from([kind]),
            ..Self::default()
        }
    }

    /// An object shape with the given properties.
    pub fn object(properties: BTreeMap<String, CanonicalSchema>) -> Self {
        Self {
            types: BTreeSet::from([Kind::Object]),
            properties,
            ..Self::default()
        }
    }

    /// Whether `null` is admitted.
    pub fn is_nullable(&self) -> bool {
        self.types.contains(&Kind::Null)
    }

    /// Admitted kinds other than `null`.
    pub fn non_null_kinds(&self) -> impl Iterator<Item = Kind> + '_ {
        self.types.iter().copied().filter(|kind| *kind != Kind::Null)
    }

    /// Whether `null` is the only admitted kind.
    pub fn is_null_only(&self) -> bool {
        !self.types.is_empty() && self.non_null_kinds().next().is_none()
    }

    fn is_literal(&self) -> bool {
        let mut kinds = self.non_null_kinds();
        matches!((kinds.next(), kinds.next()), (Some(kind), None) if !kind.is_container())
    }

    fn sort_key(&self) -> (Vec<Kind>, Option<&str>) {
        (self.non_null_kinds().collect(), self.format.as_deref())
    }

    /// Drops attributes that do not apply to the admitted kinds.
    fn pruned(mut self) -> Self {
        if self.types.is_empty() {
            return self;
        }
        if !self.types.contains(&Kind::Object) {
            self.properties.clear();
            self.required.clear();
        }
        if !self.types.contains(&Kind::Array) {
            self.items = None;
        }
        if !self.types.contains(&Kind::String) {
            self.format = None;
        }
        let accepted = self
            .default
            .as_ref()
            .is_some_and(|value| self.non_null_kinds().any(|kind| kind.accepts(value)));
        if !accepted {
            self.default = None;
        }
        self
    }

    /// Renders the shape back into schema-document form.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert(
            "type".to_string(),
            Value::Array(
                self.types
                    .iter()
                    .map(|kind| Value::String(kind.as_str().to_string()))
                    .collect(),
            ),
        );
        if !self.properties.is_empty() || self.types.contains(&Kind::Object) {
            object.insert(
                "properties".to_string(),
                Value::Object(
                    self.properties
                        .iter()
                        .map(|(name, schema)| (name.clone(), schema.to_value()))
                        .collect(),
                ),
            );
        }
        if !self.required.is_empty() {
            object.insert(
                "required".to_string(),
                Value::Array(self.required.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(items) = &self.items {
            object.insert("items".to_string(), items.to_value());
        }
        if let Some(format) = &self.format {
            object.insert("format".to_string(), Value::String(format.clone()));
        }
        if let Some(default) = &self.default {
            object.insert("default".to_string(), default.clone());
        }
        Value::Object(object)
    }
}

/// Normalized schema: a single shape or a disjoint union of shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalSchema {
    /// Exactly one structural description.
    Shape(Shape),
    /// Values validate against one of several shapes.
    Variants(Vec<Shape>),
}

impl CanonicalSchema {
    /// All shapes, a single shape being a one-element list.
    pub fn shapes(&self) -> &[Shape] {
        match self {
            CanonicalSchema::Shape(shape) => std::slice::from_ref(shape),
            CanonicalSchema::Variants(shapes) => shapes,
        }
    }

    /// Whether the schema is a variant list.
    pub fn is_union(&self) -> bool {
        matches!(self, CanonicalSchema::Variants(_))
    }

    /// Whether any shape admits `null`.
    pub fn is_nullable(&self) -> bool {
        self.shapes().iter().any(Shape::is_nullable)
    }

    /// Looks a property up in the first object shape that declares it.
    pub fn property(&self, name: &str) -> Option<&CanonicalSchema> {
        self.shapes()
            .iter()
            .find_map(|shape| shape.properties.get(name))
    }

    /// Renders the schema back into schema-document form.
    pub fn to_value(&self) -> Value {
        match self {
            CanonicalSchema::Shape(shape) => shape.to_value(),
            CanonicalSchema::Variants(shapes) => {
                let mut object = Map::new();
                object.insert(
                    "anyOf".to_string(),
                    Value::Array(shapes.iter().map(Shape::to_value).collect()),
                );
                Value::Object(object)
            }
        }
    }

    fn into_shapes(self) -> Vec<Shape> {
        match self {
            CanonicalSchema::Shape(shape) => vec![shape],
            CanonicalSchema::Variants(shapes) => shapes,
        }
    }
}

/// Reduces a raw schema document to its canonical form.
pub fn normalize(raw: &Value) -> Result<CanonicalSchema, SchemaError> {
    let document = raw.as_object().ok_or_else(|| SchemaError::NotAnObject {
        pointer: "#".to_string(),
    })?;
    check_draft(document)?;

    let normalizer = Normalizer { root: raw };
    let mut chain = Vec::new();
    let schema = normalizer.simplify(raw, "#", &mut chain)?;
    Ok(finalize(schema))
}

fn check_draft(document: &Map<String, Value>) -> Result<(), SchemaError> {
    match document.get("$schema") {
        None => Ok(()),
        Some(Value::String(uri)) if SUPPORTED_DRAFTS.iter().any(|draft| uri.contains(draft)) => {
            Ok(())
        }
        Some(Value::String(uri)) => Err(SchemaError::UnsupportedDraft(uri.clone())),
        Some(other) => Err(SchemaError::invalid_keyword(
            "#",
            "$schema",
            format!("expected a string, found {other}"),
        )),
    }
}

struct Normalizer<'a> {
    root: &'a Value,
}

impl<'a> Normalizer<'a> {
    fn simplify(
        &self,
        schema: &'a Value,
        pointer: &str,
        chain: &mut Vec<String>,
    ) -> Result<CanonicalSchema, SchemaError> {
        let object = schema.as_object().ok_or_else(|| SchemaError::NotAnObject {
            pointer: pointer.to_string(),
        })?;

        // Siblings of `$ref` are ignored, as in drafts 4 through 7.
        if let Some(reference) = object.get("$ref") {
            return self.follow(reference, pointer, chain);
        }

        let mut combined = self.keywords(object, pointer, chain)?;

        if let Some(all_of) = object.get("allOf") {
            for (index, member) in branches(all_of, pointer, "allOf")?.iter().enumerate() {
                let member = self.simplify(member, &format!("{pointer}/allOf/{index}"), chain)?;
                combined = Some(match combined {
                    Some(accumulated) => conjoin(accumulated, member),
                    None => member,
                });
            }
        }

        for keyword in ["anyOf", "oneOf"] {
            let Some(alternatives) = object.get(keyword) else {
                continue;
            };
            let mut resolved = Vec::new();
            for (index, member) in branches(alternatives, pointer, keyword)?.iter().enumerate() {
                let member = self.simplify(member, &format!("{pointer}/{keyword}/{index}"), chain)?;
                resolved.push(match &combined {
                    Some(base) => conjoin(base.clone(), member),
                    None => member,
                });
            }
            combined = Some(disjoin(resolved));
        }

        Ok(combined.unwrap_or_else(|| CanonicalSchema::Shape(Shape::default())))
    }

    fn follow(
        &self,
        reference: &Value,
        pointer: &str,
        chain: &mut Vec<String>,
    ) -> Result<CanonicalSchema, SchemaError> {
        let reference = reference
            .as_str()
            .ok_or_else(|| SchemaError::invalid_keyword(pointer, "$ref", "expected a string"))?;
        if chain.iter().any(|seen| seen == reference) {
            return Err(SchemaError::CyclicReference {
                reference: reference.to_string(),
                chain: chain.clone(),
            });
        }

        let target = self.resolve(reference)?;
        chain.push(reference.to_string());
        let resolved = self.simplify(target, reference, chain);
        chain.pop();
        resolved
    }

    fn resolve(&self, reference: &str) -> Result<&'a Value, SchemaError> {
        let unresolved = || SchemaError::UnresolvedReference(reference.to_string());
        let fragment = reference.strip_prefix('#').ok_or_else(unresolved)?;
        if fragment.is_empty() {
            return Ok(self.root);
        }
        if !fragment.starts_with('/') {
            return Err(unresolved());
        }
        self.root.pointer(fragment).ok_or_else(unresolved)
    }

    fn keywords(
        &self,
        object: &'a Map<String, Value>,
        pointer: &str,
        chain: &mut Vec<String>,
    ) -> Result<Option<CanonicalSchema>, SchemaError> {
        let mut types = match object.get("type") {
            None => BTreeSet::new(),
            Some(Value::String(name)) => BTreeSet::from([parse_kind(name, pointer)?]),
            Some(Value::Array(names)) => names
                .iter()
                .map(|name| {
                    name.as_str()
                        .ok_or_else(|| {
                            SchemaError::invalid_keyword(pointer, "type", "entries must be strings")
                        })
                        .and_then(|name| parse_kind(name, pointer))
                })
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(SchemaError::invalid_keyword(
                    pointer,
                    "type",
                    format!("expected a string or array, found {other}"),
                ))
            }
        };

        let mut properties = BTreeMap::new();
        let declares_properties = match object.get("properties") {
            None => false,
            Some(Value::Object(declared)) => {
                for (name, property) in declared {
                    let property =
                        self.simplify(property, &format!("{pointer}/properties/{name}"), chain)?;
                    properties.insert(name.clone(), property);
                }
                true
            }
            Some(_) => {
                return Err(SchemaError::invalid_keyword(
                    pointer,
                    "properties",
                    "expected an object",
                ))
            }
        };

        let required = match object.get("required") {
            None => BTreeSet::new(),
            Some(Value::Array(names)) => names
                .iter()
                .map(|name| {
                    name.as_str().map(str::to_string).ok_or_else(|| {
                        SchemaError::invalid_keyword(pointer, "required", "entries must be strings")
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(SchemaError::invalid_keyword(
                    pointer,
                    "required",
                    "expected an array",
                ))
            }
        };

        let items = match object.get("items") {
            None | Some(Value::Bool(_)) => None,
            Some(single @ Value::Object(_)) => {
                Some(self.simplify(single, &format!("{pointer}/items"), chain)?)
            }
            Some(Value::Array(tuple)) => {
                let mut members = Vec::with_capacity(tuple.len());
                for (index, member) in tuple.iter().enumerate() {
                    members.push(self.simplify(member, &format!("{pointer}/items/{index}"), chain)?);
                }
                (!members.is_empty()).then(|| disjoin(members))
            }
            Some(_) => {
                return Err(SchemaError::invalid_keyword(
                    pointer,
                    "items",
                    "expected an object or array",
                ))
            }
        };

        let format = match object.get("format") {
            None => None,
            Some(Value::String(format)) => Some(format.clone()),
            Some(_) => {
                return Err(SchemaError::invalid_keyword(
                    pointer,
                    "format",
                    "expected a string",
                ))
            }
        };
        let default = object.get("default").cloned();

        if types.is_empty()
            && !declares_properties
            && required.is_empty()
            && items.is_none()
            && format.is_none()
            && default.is_none()
        {
            return Ok(None);
        }

        if types.is_empty() {
            if declares_properties || !required.is_empty() {
                types.insert(Kind::Object);
            }
            if items.is_some() {
                types.insert(Kind::Array);
            }
            if format.is_some() {
                types.insert(Kind::String);
            }
        }

        Ok(Some(split_kinds(Shape {
            types,
            properties,
            required,
            items: items.map(Box::new),
            format,
            default,
        })))
    }
}

fn parse_kind(name: &str, pointer: &str) -> Result<Kind, SchemaError> {
    Kind::parse(name).ok_or_else(|| {
        SchemaError::invalid_keyword(pointer, "type", format!("unknown type '{name}'"))
    })
}

fn branches<'v>(
    value: &'v Value,
    pointer: &str,
    keyword: &'static str,
) -> Result<&'v Vec<Value>, SchemaError> {
    match value {
        Value::Array(members) if !members.is_empty() => Ok(members),
        _ => Err(SchemaError::invalid_keyword(
            pointer,
            keyword,
            "expected a non-empty array",
        )),
    }
}

/// Turns a shape advertising several kinds into one branch per kind.
fn split_kinds(shape: Shape) -> CanonicalSchema {
    let kinds: Vec<Kind> = shape.non_null_kinds().collect();
    if kinds.len() <= 1 {
        return CanonicalSchema::Shape(shape.pruned());
    }

    let nullable = shape.is_nullable();
    let branches = kinds
        .into_iter()
        .map(|kind| {
            let mut branch = Shape::of_kind(kind);
            if nullable {
                branch.types.insert(Kind::Null);
            }
            match kind {
                Kind::Object => {
                    branch.properties = shape.properties.clone();
                    branch.required = shape.required.clone();
                }
                Kind::Array => branch.items = shape.items.clone(),
                Kind::String => branch.format = shape.format.clone(),
                _ => {}
            }
            branch.default = shape.default.clone();
            CanonicalSchema::Shape(branch.pruned())
        })
        .collect();
    disjoin(branches)
}

/// "All of these shapes at once."
fn conjoin(left: CanonicalSchema, right: CanonicalSchema) -> CanonicalSchema {
    match (left, right) {
        (CanonicalSchema::Shape(left), CanonicalSchema::Shape(right)) => {
            split_kinds(conjoin_shapes(left, right))
        }
        (CanonicalSchema::Variants(branches), other)
        | (other, CanonicalSchema::Variants(branches)) => {
            // Branches that cannot coexist with the other side drop out, unless
            // none can, in which case the scalar preference below decides.
            let (compatible, rejected): (Vec<Shape>, Vec<Shape>) = branches
                .into_iter()
                .partition(|branch| is_compatible(branch, &other));
            let chosen = if compatible.is_empty() { rejected } else { compatible };
            disjoin(
                chosen
                    .into_iter()
                    .map(|branch| conjoin(CanonicalSchema::Shape(branch), other.clone()))
                    .collect(),
            )
        }
    }
}

fn is_compatible(shape: &Shape, other: &CanonicalSchema) -> bool {
    other.shapes().iter().any(|candidate| {
        shape.types.is_empty()
            || candidate.types.is_empty()
            || (shape.is_nullable() && candidate.is_nullable())
            || !common_kinds(&shape.types, &candidate.types).is_empty()
    })
}

fn common_kinds(left: &BTreeSet<Kind>, right: &BTreeSet<Kind>) -> BTreeSet<Kind> {
    let allows = |set: &BTreeSet<Kind>, kind: Kind| {
        set.contains(&kind) || (kind == Kind::Integer && set.contains(&Kind::Number))
    };
    left.iter()
        .chain(right.iter())
        .copied()
        .filter(|kind| *kind != Kind::Null && allows(left, *kind) && allows(right, *kind))
        .collect()
}

fn conjoin_shapes(mut left: Shape, right: Shape) -> Shape {
    left.types = conjoin_types(&left.types, &right.types);

    for (name, schema) in right.properties {
        let merged = match left.properties.remove(&name) {
            Some(existing) => conjoin(existing, schema),
            None => schema,
        };
        left.properties.insert(name, merged);
    }
    left.required.extend(right.required);

    left.items = match (left.items.take(), right.items) {
        (Some(mine), Some(theirs)) => Some(Box::new(conjoin(*mine, *theirs))),
        (mine, theirs) => mine.or(theirs),
    };
    left.format = left.format.or(right.format);
    left.default = left.default.or(right.default);
    left
}

fn conjoin_types(left: &BTreeSet<Kind>, right: &BTreeSet<Kind>) -> BTreeSet<Kind> {
    // An empty set carries no type constraint.
    if left.is_empty() {
        return right.clone();
    }
    if right.is_empty() {
        return left.clone();
    }

    let mut common = common_kinds(left, right);
    if common.is_empty() {
        let scalars = |set: &BTreeSet<Kind>| {
            set.iter()
                .copied()
                .filter(|kind| *kind != Kind::Null && !kind.is_container())
                .collect::<BTreeSet<_>>()
        };
        common = scalars(left);
        if common.is_empty() {
            common = scalars(right);
        }
        if common.is_empty() {
            common = left.iter().copied().filter(|kind| *kind != Kind::Null).collect();
        }
    }

    if left.contains(&Kind::Null) && right.contains(&Kind::Null) {
        common.insert(Kind::Null);
    }
    common
}

/// "Any of these shapes."
fn disjoin(alternatives: Vec<CanonicalSchema>) -> CanonicalSchema {
    let mut shapes: Vec<Shape> = alternatives
        .into_iter()
        .flat_map(CanonicalSchema::into_shapes)
        .map(|mut shape| {
            if shape.types.is_empty() {
                shape.types.insert(Kind::Object);
                shape = shape.pruned();
            }
            shape
        })
        .collect();

    if shapes.iter().any(Shape::is_nullable) {
        for shape in &mut shapes {
            shape.types.insert(Kind::Null);
        }
    }
    if shapes.iter().any(|shape| !shape.is_null_only()) {
        shapes.retain(|shape| !shape.is_null_only());
    }

    let mut merged: Vec<Shape> = Vec::with_capacity(shapes.len());
    for shape in shapes {
        if merged.contains(&shape) {
            continue;
        }
        if shape.is_literal() {
            if let Some(existing) = merged.iter_mut().find(|existing| {
                existing.is_literal()
                    && existing.types == shape.types
                    && existing.format == shape.format
            }) {
                if existing.default.is_none() {
                    existing.default = shape.default;
                }
                continue;
            }
        }
        merged.push(shape);
    }
    merged.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    match merged.len() {
        0 => CanonicalSchema::Shape(Shape::default()),
        1 => CanonicalSchema::Shape(merged.remove(0)),
        _ => CanonicalSchema::Variants(merged),
    }
}

/// Gives unconstrained shapes an (empty) object shape, recursively.
fn finalize(schema: CanonicalSchema) -> CanonicalSchema {
    let shapes = schema
        .into_shapes()
        .into_iter()
        .map(|mut shape| {
            if shape.types.is_empty() {
                shape.types.insert(Kind::Object);
                shape = shape.pruned();
            }
            shape.properties = shape
                .properties
                .into_iter()
                .map(|(name, property)| (name, finalize(property)))
                .collect();
            shape.items = shape.items.map(|items| Box::new(finalize(*items)));
            CanonicalSchema::Shape(shape)
        })
        .collect();
    disjoin(shapes)
}
