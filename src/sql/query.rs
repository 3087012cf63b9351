//! Typed representation of a document query.
//!
//! A query arrives as a JSON object. It is parsed once into [`Query`], whose
//! variants cover every shape the predicate compiler understands; anything
//! else is rejected here with `UnsupportedOperation` or `InvalidQuery`.

use chrono::NaiveDateTime;
use serde_json::{Map, Number, Value};

use crate::error::{AdapterError, AdapterResult};
use crate::storage::codec::{self, type_tag};
use crate::storage::geo::{self, GeoPoint, EARTH_RADIUS_KM, EARTH_RADIUS_MI};

/// A parsed query: a conjunction of clauses
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Field { name: String, condition: Condition },
    Or(Vec<Query>),
    And(Vec<Query>),
    Nor(Vec<Query>),
}

/// Condition applied to a single field (or dotted path)
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Null,
    Literal(Literal),
    Pointer(Value),
    Date(NaiveDateTime),
    GeoPoint(GeoPoint),
    Polygon(Value),
    Operators(Vec<Operator>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Number(Number),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparator {
    pub const ALL: [(&'static str, Comparator); 4] = [
        ("$gt", Comparator::Gt),
        ("$gte", Comparator::Gte),
        ("$lt", Comparator::Lt),
        ("$lte", Comparator::Lte),
    ];

    pub fn sql(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().find(|(k, _)| *k == key).map(|(_, c)| *c)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextSearch {
    pub term: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Ne(Value),
    Eq(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    All(Vec<Value>),
    Exists(bool),
    ContainedBy(Vec<Value>),
    Text(TextSearch),
    /// `max_distance` is in radians
    NearSphere { point: GeoPoint, max_distance: Option<f64> },
    WithinBox { south_west: GeoPoint, north_east: GeoPoint },
    /// `radius` is in radians
    CenterSphere { point: GeoPoint, radius: f64 },
    WithinPolygon(Vec<GeoPoint>),
    IntersectsPoint(GeoPoint),
    Regex { pattern: String, options: String },
    Compare(Comparator, Value),
}

/// Operator keys in the order their predicates are produced
const OPERATOR_ORDER: [&str; 17] = [
    "$ne",
    "$eq",
    "$in",
    "$nin",
    "$all",
    "$exists",
    "$containedBy",
    "$text",
    "$nearSphere",
    "$within",
    "$geoWithin",
    "$geoIntersects",
    "$regex",
    "$gt",
    "$gte",
    "$lt",
    "$lte",
];

/// Keys that only qualify another operator
const MODIFIER_KEYS: [&str; 5] = [
    "$options",
    "$maxDistance",
    "$maxDistanceInRadians",
    "$maxDistanceInKilometers",
    "$maxDistanceInMiles",
];

impl Query {
    pub fn parse(value: &Value) -> AdapterResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| AdapterError::InvalidQuery(format!("query must be an object: {}", value)))?;

        let mut clauses = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            let clause = match key.as_str() {
                "$or" => Clause::Or(parse_sub_queries(key, value)?),
                "$and" => Clause::And(parse_sub_queries(key, value)?),
                "$nor" => Clause::Nor(parse_sub_queries(key, value)?),
                other if other.starts_with('$') => {
                    return Err(AdapterError::UnsupportedOperation(format!(
                        "unsupported query operator: {}",
                        other
                    )))
                }
                other if other.starts_with("_auth_data_") => {
                    return Err(AdapterError::UnsupportedOperation(format!(
                        "cannot query on '{}'; query authData.<provider> instead",
                        other
                    )))
                }
                _ => Clause::Field {
                    name: key.clone(),
                    condition: Condition::parse(value)?,
                },
            };
            clauses.push(clause);
        }
        Ok(Self { clauses })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The first `$text` search of the query, searching nested clauses too
    pub fn text_search(&self) -> Option<(&str, &TextSearch)> {
        self.clauses.iter().find_map(|clause| match clause {
            Clause::Field {
                name,
                condition: Condition::Operators(ops),
            } => ops.iter().find_map(|op| match op {
                Operator::Text(search) => Some((name.as_str(), search)),
                _ => None,
            }),
            Clause::Or(subs) | Clause::And(subs) | Clause::Nor(subs) => {
                subs.iter().find_map(Query::text_search)
            }
            _ => None,
        })
    }
}

fn parse_sub_queries(key: &str, value: &Value) -> AdapterResult<Vec<Query>> {
    let items = value
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| AdapterError::InvalidQuery(format!("{} must be a non-empty array", key)))?;
    items.iter().map(Query::parse).collect()
}

impl Condition {
    pub fn parse(value: &Value) -> AdapterResult<Self> {
        match value {
            Value::Null => Ok(Condition::Null),
            Value::String(s) => Ok(Condition::Literal(Literal::String(s.clone()))),
            Value::Number(n) => Ok(Condition::Literal(Literal::Number(n.clone()))),
            Value::Bool(b) => Ok(Condition::Literal(Literal::Bool(*b))),
            Value::Array(_) => Err(AdapterError::UnsupportedOperation(format!(
                "array equality is not supported: {}",
                value
            ))),
            Value::Object(obj) => match type_tag(value) {
                Some("Pointer") => {
                    codec::pointer_id(value)?;
                    Ok(Condition::Pointer(value.clone()))
                }
                Some("Date") => codec::date_from_value(value).map(Condition::Date),
                Some("GeoPoint") => GeoPoint::from_value(value).map(Condition::GeoPoint),
                Some("Polygon") => Ok(Condition::Polygon(value.clone())),
                Some(other) => Err(AdapterError::UnsupportedOperation(format!(
                    "cannot query by {} value",
                    other
                ))),
                None => parse_operators(obj).map(Condition::Operators),
            },
        }
    }
}

fn parse_operators(obj: &Map<String, Value>) -> AdapterResult<Vec<Operator>> {
    for key in obj.keys() {
        if !OPERATOR_ORDER.contains(&key.as_str()) && !MODIFIER_KEYS.contains(&key.as_str()) {
            return Err(AdapterError::UnsupportedOperation(format!(
                "unsupported operator {} in {}",
                key,
                Value::Object(obj.clone())
            )));
        }
    }

    let mut operators = Vec::new();
    for key in OPERATOR_ORDER {
        let value = match obj.get(key) {
            Some(v) => v,
            None => continue,
        };
        let operator = match key {
            "$ne" => Operator::Ne(value.clone()),
            "$eq" => Operator::Eq(value.clone()),
            "$in" => Operator::In(array_operand(key, value)?),
            "$nin" => Operator::Nin(array_operand(key, value)?),
            "$all" => Operator::All(array_operand(key, value)?),
            "$exists" => match value {
                Value::Bool(b) => Operator::Exists(*b),
                _ if value.get("$relativeTime").is_some() => {
                    return Err(AdapterError::InvalidQuery(
                        "$relativeTime can only be used with the $lt, $lte, $gt, and $gte operators"
                            .to_string(),
                    ))
                }
                _ => return Err(AdapterError::InvalidQuery(format!("bad $exists value: {}", value))),
            },
            "$containedBy" => Operator::ContainedBy(
                value
                    .as_array()
                    .cloned()
                    .ok_or_else(|| AdapterError::InvalidQuery("bad $containedBy: should be an array".to_string()))?,
            ),
            "$text" => Operator::Text(parse_text(value)?),
            "$nearSphere" => Operator::NearSphere {
                point: GeoPoint::from_value(value)?,
                max_distance: max_distance(obj)?,
            },
            "$within" => parse_within(value)?,
            "$geoWithin" => parse_geo_within(value)?,
            "$geoIntersects" => {
                let point = value
                    .get("$point")
                    .ok_or_else(|| AdapterError::UnsupportedOperation(format!("bad $geoIntersects value: {}", value)))?;
                if type_tag(point) != Some("GeoPoint") {
                    return Err(AdapterError::InvalidQuery(
                        "bad $geoIntersect value; $point should be GeoPoint".to_string(),
                    ));
                }
                Operator::IntersectsPoint(GeoPoint::from_value(point)?)
            }
            "$regex" => {
                let pattern = value
                    .as_str()
                    .ok_or_else(|| AdapterError::InvalidQuery(format!("bad $regex: {}", value)))?;
                let options = match obj.get("$options") {
                    None => String::new(),
                    Some(Value::String(o)) if o.chars().all(|c| "imxs".contains(c)) => o.clone(),
                    Some(other) => {
                        return Err(AdapterError::InvalidQuery(format!(
                            "bad $options value for query: {}",
                            other
                        )))
                    }
                };
                Operator::Regex {
                    pattern: pattern.to_string(),
                    options,
                }
            }
            cmp => match Comparator::from_key(cmp) {
                Some(c) => Operator::Compare(c, value.clone()),
                None => continue,
            },
        };
        operators.push(operator);
    }

    if operators.is_empty() {
        return Err(AdapterError::InvalidQuery(format!(
            "modifiers without an operator: {}",
            Value::Object(obj.clone())
        )));
    }
    Ok(operators)
}

fn array_operand(key: &str, value: &Value) -> AdapterResult<Vec<Value>> {
    value
        .as_array()
        .cloned()
        .ok_or_else(|| AdapterError::InvalidQuery(format!("bad {} value", key)))
}

fn parse_text(value: &Value) -> AdapterResult<TextSearch> {
    let search = value
        .get("$search")
        .and_then(Value::as_object)
        .ok_or_else(|| AdapterError::InvalidQuery("bad $text: $search, should be object".to_string()))?;

    let term = search
        .get("$term")
        .and_then(Value::as_str)
        .ok_or_else(|| AdapterError::InvalidQuery("bad $text: $term, should be string".to_string()))?;

    let language = match search.get("$language") {
        None => None,
        Some(Value::String(l)) => Some(l.clone()),
        Some(_) => {
            return Err(AdapterError::InvalidQuery(
                "bad $text: $language, should be string".to_string(),
            ))
        }
    };

    match search.get("$caseSensitive") {
        None | Some(Value::Bool(false)) => {}
        Some(Value::Bool(true)) => {
            return Err(AdapterError::InvalidQuery(
                "bad $text: $caseSensitive not supported, please use $regex or create a separate lower case column."
                    .to_string(),
            ))
        }
        Some(_) => {
            return Err(AdapterError::InvalidQuery(
                "bad $text: $caseSensitive, should be boolean".to_string(),
            ))
        }
    }

    match search.get("$diacriticSensitive") {
        None | Some(Value::Bool(true)) => {}
        Some(Value::Bool(false)) => {
            return Err(AdapterError::InvalidQuery(
                "bad $text: $diacriticSensitive - false not supported, install Postgres Unaccent Extension"
                    .to_string(),
            ))
        }
        Some(_) => {
            return Err(AdapterError::InvalidQuery(
                "bad $text: $diacriticSensitive, should be boolean".to_string(),
            ))
        }
    }

    Ok(TextSearch {
        term: term.to_string(),
        language,
    })
}

fn max_distance(obj: &Map<String, Value>) -> AdapterResult<Option<f64>> {
    let conversions = [
        ("$maxDistance", 1.0),
        ("$maxDistanceInRadians", 1.0),
        ("$maxDistanceInKilometers", 1.0 / EARTH_RADIUS_KM),
        ("$maxDistanceInMiles", 1.0 / EARTH_RADIUS_MI),
    ];
    for (key, factor) in conversions {
        if let Some(v) = obj.get(key) {
            let d = v
                .as_f64()
                .filter(|d| d.is_finite() && *d >= 0.0)
                .ok_or_else(|| AdapterError::InvalidQuery(format!("bad {} value: {}", key, v)))?;
            return Ok(Some(d * factor));
        }
    }
    Ok(None)
}

fn parse_within(value: &Value) -> AdapterResult<Operator> {
    let corners = value
        .get("$box")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::UnsupportedOperation(format!("bad $within value: {}", value)))?;
    match corners.as_slice() {
        [south_west, north_east] => Ok(Operator::WithinBox {
            south_west: GeoPoint::from_value(south_west)?,
            north_east: GeoPoint::from_value(north_east)?,
        }),
        _ => Err(AdapterError::InvalidQuery(
            "bad $within value; $box should contain exactly two GeoPoints".to_string(),
        )),
    }
}

fn parse_geo_within(value: &Value) -> AdapterResult<Operator> {
    if let Some(center) = value.get("$centerSphere") {
        let parts = center
            .as_array()
            .filter(|parts| parts.len() >= 2)
            .ok_or_else(|| {
                AdapterError::InvalidQuery(
                    "bad $geoWithin value; $centerSphere should be an array of GeoPoint and distance".to_string(),
                )
            })?;
        let point = GeoPoint::from_value(&parts[0]).map_err(|_| {
            AdapterError::InvalidQuery("bad $geoWithin value; $centerSphere geo point invalid".to_string())
        })?;
        let radius = parts[1]
            .as_f64()
            .filter(|r| r.is_finite() && *r >= 0.0)
            .ok_or_else(|| {
                AdapterError::InvalidQuery("bad $geoWithin value; $centerSphere distance invalid".to_string())
            })?;
        return Ok(Operator::CenterSphere { point, radius });
    }

    if let Some(polygon) = value.get("$polygon") {
        let points = match polygon {
            Value::Object(_) if type_tag(polygon) == Some("Polygon") => {
                let coords = geo::coordinates_from_value(polygon.get("coordinates").unwrap_or(&Value::Null))?;
                coords
                    .iter()
                    .map(|[lat, lon]| GeoPoint::new(*lat, *lon))
                    .collect::<AdapterResult<Vec<_>>>()?
            }
            Value::Array(items) => items
                .iter()
                .map(GeoPoint::from_value)
                .collect::<AdapterResult<Vec<_>>>()?,
            _ => {
                return Err(AdapterError::InvalidQuery(
                    "bad $geoWithin value; $polygon should be Polygon object or Array of GeoPoints".to_string(),
                ))
            }
        };
        if points.len() < 3 {
            return Err(AdapterError::Geometry(
                "bad $geoWithin value; $polygon should contain at least 3 GeoPoints".to_string(),
            ));
        }
        return Ok(Operator::WithinPolygon(points));
    }

    Err(AdapterError::UnsupportedOperation(format!(
        "bad $geoWithin value: {}",
        value
    )))
}
