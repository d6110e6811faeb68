//! In-process aggregation evaluator shared by every store backend.
//!
//! Covers the subset of document-store aggregation the analytics passes need:
//! `$match`, `$unwind`, `$group` (`$sum`, `$first`, `$push`), `$project`,
//! `$sort` and `$limit`. Field paths are dotted (`profile.watchers`).

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::{Map, Value};

/// Look up a dotted path inside a document.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |cur, part| cur.as_object()?.get(part))
}

/// Write a dotted path, creating intermediate objects. Non-object
/// intermediates are replaced.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut cur = doc;
    while let Some(part) = parts.next() {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        let Some(obj) = cur.as_object_mut() else {
            return;
        };
        if parts.peek().is_none() {
            obj.insert(part.to_string(), value);
            return;
        }
        cur = obj
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn is_absent(v: Option<&Value>) -> bool {
    matches!(v, None | Some(Value::Null))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Equal, or an array field containing the value.
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    /// Present and ordered at or above the value.
    Gte(String, Value),
    /// Present and not null.
    Exists(String),
    /// Present, not null, not an empty string/array/object.
    NotEmpty(String),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Filter::Ne(field.to_string(), value.into())
    }

    pub fn gte(field: &str, value: impl Into<Value>) -> Self {
        Filter::Gte(field.to_string(), value.into())
    }

    pub fn not_fork() -> Self {
        Filter::ne("isFork", true)
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::Eq(field, want) => field_equals(get_path(doc, field), want),
            Filter::Ne(field, want) => !field_equals(get_path(doc, field), want),
            Filter::In(field, wants) => {
                let got = get_path(doc, field);
                wants.iter().any(|w| field_equals(got, w))
            }
            Filter::Gte(field, min) => {
                let got = get_path(doc, field);
                !is_absent(got) && compare_values(got, Some(min)) != Ordering::Less
            }
            Filter::Exists(field) => !is_absent(get_path(doc, field)),
            Filter::NotEmpty(field) => match get_path(doc, field) {
                None | Some(Value::Null) => false,
                Some(Value::String(s)) => !s.trim().is_empty(),
                Some(Value::Array(a)) => !a.is_empty(),
                Some(Value::Object(o)) => !o.is_empty(),
                Some(_) => true,
            },
            Filter::And(all) => all.iter().all(|f| f.matches(doc)),
        }
    }
}

fn field_equals(got: Option<&Value>, want: &Value) -> bool {
    match got {
        None => want.is_null(),
        Some(Value::Array(items)) if !want.is_array() => {
            items.iter().any(|item| compare_values(Some(item), Some(want)) == Ordering::Equal)
        }
        Some(v) => compare_values(Some(v), Some(want)) == Ordering::Equal,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            descending: false,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            descending: true,
        }
    }

    /// `"-updatedAt"` sorts descending, `"login"` ascending.
    pub fn parse(field: &str) -> Self {
        match field.strip_prefix('-') {
            Some(field) => Self::desc(field),
            None => Self::asc(field.trim_start_matches('+')),
        }
    }
}

fn type_rank(v: Option<&Value>) -> u8 {
    match v {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order over JSON values: missing/null < numbers < strings < objects
/// < arrays < booleans.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(0.0)
                .total_cmp(&y.as_f64().unwrap_or(0.0)),
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x @ Value::Object(_)), Some(y @ Value::Object(_)))
        | (Some(x @ Value::Array(_)), Some(y @ Value::Array(_))) => {
            x.to_string().cmp(&y.to_string())
        }
        _ => Ordering::Equal,
    }
}

/// Stable multi-key sort.
pub fn sort_documents(docs: &mut [Value], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        keys.iter()
            .map(|k| {
                let ord = compare_values(get_path(a, &k.field), get_path(b, &k.field));
                if k.descending {
                    ord.reverse()
                } else {
                    ord
                }
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    /// `$sum: 1`
    Count,
    /// `$sum: "$field"`; non-numeric and missing values count as zero.
    Sum(String),
    /// `$first: "$field"`
    First(String),
    /// `$push: {out: "$path", ...}`
    Push(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// Grouping path; `None` collapses everything into one `_id: null` group.
    pub key: Option<String>,
    pub fields: Vec<(String, Accumulator)>,
}

impl Group {
    pub fn by(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            fields: Vec::new(),
        }
    }

    pub fn all() -> Self {
        Self {
            key: None,
            fields: Vec::new(),
        }
    }

    pub fn with(mut self, name: &str, acc: Accumulator) -> Self {
        self.fields.push((name.to_string(), acc));
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Total {
    Int(i64),
    Float(f64),
}

impl Total {
    fn add(self, v: Option<&Value>) -> Self {
        let Some(Value::Number(n)) = v else {
            return self;
        };
        match (self, n.as_i64()) {
            (Total::Int(acc), Some(i)) => Total::Int(acc.saturating_add(i)),
            (Total::Int(acc), None) => Total::Float(acc as f64 + n.as_f64().unwrap_or(0.0)),
            (Total::Float(acc), _) => Total::Float(acc + n.as_f64().unwrap_or(0.0)),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Total::Int(i) => Value::from(i),
            Total::Float(f) => Value::from(f),
        }
    }
}

enum Slot {
    Total(Total),
    First(Option<Value>),
    Push(Vec<Value>),
}

fn run_group(group: &Group, docs: Vec<Value>) -> Vec<Value> {
    let mut order: Vec<Value> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut slots: Vec<Vec<Slot>> = Vec::new();

    for doc in &docs {
        let key = match &group.key {
            Some(path) => get_path(doc, path).cloned().unwrap_or(Value::Null),
            None => Value::Null,
        };
        let idx = *index.entry(key.to_string()).or_insert_with(|| {
            order.push(key.clone());
            slots.push(
                group
                    .fields
                    .iter()
                    .map(|(_, acc)| match acc {
                        Accumulator::Count | Accumulator::Sum(_) => Slot::Total(Total::Int(0)),
                        Accumulator::First(_) => Slot::First(None),
                        Accumulator::Push(_) => Slot::Push(Vec::new()),
                    })
                    .collect(),
            );
            order.len() - 1
        });

        for ((_, acc), slot) in group.fields.iter().zip(slots[idx].iter_mut()) {
            match (acc, slot) {
                (Accumulator::Count, Slot::Total(t)) => *t = t.add(Some(&Value::from(1))),
                (Accumulator::Sum(path), Slot::Total(t)) => *t = t.add(get_path(doc, path)),
                (Accumulator::First(path), Slot::First(first)) => {
                    if first.is_none() {
                        *first = Some(get_path(doc, path).cloned().unwrap_or(Value::Null));
                    }
                }
                (Accumulator::Push(shape), Slot::Push(items)) => {
                    let mut obj = Map::new();
                    for (out, path) in shape {
                        obj.insert(
                            out.clone(),
                            get_path(doc, path).cloned().unwrap_or(Value::Null),
                        );
                    }
                    items.push(Value::Object(obj));
                }
                _ => {}
            }
        }
    }

    order
        .into_iter()
        .zip(slots)
        .map(|(key, slots)| {
            let mut out = Map::new();
            out.insert("_id".to_string(), key);
            for ((name, _), slot) in group.fields.iter().zip(slots) {
                let value = match slot {
                    Slot::Total(t) => t.into_value(),
                    Slot::First(v) => v.unwrap_or(Value::Null),
                    Slot::Push(items) => Value::Array(items),
                };
                out.insert(name.clone(), value);
            }
            Value::Object(out)
        })
        .collect()
}

fn run_unwind(path: &str, docs: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let Some(Value::Array(items)) = get_path(&doc, path).cloned() else {
            continue;
        };
        for item in items {
            let mut copy = doc.clone();
            set_path(&mut copy, path, item);
            out.push(copy);
        }
    }
    out
}

fn run_project(fields: &[(String, String)], docs: Vec<Value>) -> Vec<Value> {
    docs.into_iter()
        .map(|doc| {
            let mut out = Map::new();
            for (name, path) in fields {
                if let Some(v) = get_path(&doc, path) {
                    out.insert(name.clone(), v.clone());
                }
            }
            Value::Object(out)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Unwind(String),
    Group(Group),
    /// `(output name, source path)` pairs.
    Project(Vec<(String, String)>),
    Sort(Vec<SortKey>),
    Limit(usize),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matching(mut self, filter: Filter) -> Self {
        self.stages.push(Stage::Match(filter));
        self
    }

    pub fn unwind(mut self, path: &str) -> Self {
        self.stages.push(Stage::Unwind(path.to_string()));
        self
    }

    pub fn group(mut self, group: Group) -> Self {
        self.stages.push(Stage::Group(group));
        self
    }

    pub fn project(mut self, fields: &[(&str, &str)]) -> Self {
        self.stages.push(Stage::Project(
            fields
                .iter()
                .map(|(n, p)| (n.to_string(), p.to_string()))
                .collect(),
        ));
        self
    }

    pub fn sort(mut self, keys: Vec<SortKey>) -> Self {
        if !keys.is_empty() {
            self.stages.push(Stage::Sort(keys));
        }
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.stages.push(Stage::Limit(n));
        self
    }

    pub fn run(&self, mut docs: Vec<Value>) -> Vec<Value> {
        for stage in &self.stages {
            docs = match stage {
                Stage::Match(f) => docs.into_iter().filter(|d| f.matches(d)).collect(),
                Stage::Unwind(path) => run_unwind(path, docs),
                Stage::Group(g) => run_group(g, docs),
                Stage::Project(fields) => run_project(fields, docs),
                Stage::Sort(keys) => {
                    sort_documents(&mut docs, keys);
                    docs
                }
                Stage::Limit(n) => {
                    docs.truncate(*n);
                    docs
                }
            };
        }
        docs
    }
}
