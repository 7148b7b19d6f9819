//! 構造化ドキュメント
//!
//! YAML 記述子から読み込んだ値を、プロバイダーの型付きデコードまで運ぶための
//! タグ付き値型です (string | number | bool | null | 順序付きマップ | シーケンス)。
//! マップはキーの挿入順を保持するため、解決結果の差分が安定します。

use crate::error::DecodeError;
use serde::de::{DeserializeOwned, Error as _};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub use serde_json::Number;

/// タグ付き構造化値
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Document {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Map(Mapping),
    Seq(Vec<Document>),
}

/// 挿入順を保持する文字列キーのマップ
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mapping {
    entries: Vec<(String, Document)>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Document> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Document> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// 値を挿入する。既存キーの場合は位置を保ったまま置き換え、古い値を返す
    pub fn insert(&mut self, key: impl Into<String>, value: Document) -> Option<Document> {
        let key = key.into();
        if let Some(slot) = self.get_mut(&key) {
            return Some(std::mem::replace(slot, value));
        }
        self.entries.push((key, value));
        None
    }

    pub fn remove(&mut self, key: &str) -> Option<Document> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Document)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl FromIterator<(String, Document)> for Mapping {
    fn from_iter<I: IntoIterator<Item = (String, Document)>>(iter: I) -> Self {
        let mut mapping = Mapping::new();
        for (key, value) in iter {
            mapping.insert(key, value);
        }
        mapping
    }
}

impl IntoIterator for Mapping {
    type Item = (String, Document);
    type IntoIter = std::vec::IntoIter<(String, Document)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Document {
    /// 空のマップ
    pub fn map() -> Self {
        Document::Map(Mapping::new())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Document::Null => "null",
            Document::Bool(_) => "bool",
            Document::Number(_) => "number",
            Document::String(_) => "string",
            Document::Map(_) => "map",
            Document::Seq(_) => "sequence",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Document::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Document::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Document::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Document::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Mapping> {
        match self {
            Document::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut Mapping> {
        match self {
            Document::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Document]> {
        match self {
            Document::Seq(items) => Some(items),
            _ => None,
        }
    }

    /// マップのキーを参照
    pub fn get(&self, key: &str) -> Option<&Document> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// ドット区切りのパスで値を参照 (`endpoint.port`, `hosts.0`)
    pub fn pointer(&self, path: &str) -> Option<&Document> {
        if path.is_empty() {
            return Some(self);
        }
        let mut current = self;
        for segment in path.split('.') {
            current = match current {
                Document::Map(m) => m.get(segment)?,
                Document::Seq(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// 文字列に埋め込める値ならその表現を返す
    pub fn render_scalar(&self) -> Option<String> {
        match self {
            Document::String(s) => Some(s.clone()),
            Document::Number(n) => Some(n.to_string()),
            Document::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// いずれかの文字列値が条件を満たすか (マップのキーは対象外)
    pub fn any_str(&self, predicate: &dyn Fn(&str) -> bool) -> bool {
        match self {
            Document::String(s) => predicate(s),
            Document::Map(m) => m.iter().any(|(_, v)| v.any_str(predicate)),
            Document::Seq(items) => items.iter().any(|v| v.any_str(predicate)),
            _ => false,
        }
    }

    /// 文字列値を順に走査
    pub fn visit_strings<'a>(&'a self, path: &str, visit: &mut dyn FnMut(&str, &'a str)) {
        match self {
            Document::String(s) => visit(path, s),
            Document::Map(m) => {
                for (key, value) in m.iter() {
                    value.visit_strings(&join_path(path, key), visit);
                }
            }
            Document::Seq(items) => {
                for (index, value) in items.iter().enumerate() {
                    value.visit_strings(&join_path(path, &index.to_string()), visit);
                }
            }
            _ => {}
        }
    }

    /// 文字列値を置き換えた複製 (パスは `visit_strings` と同じ形式)
    pub fn map_strings(&self, path: &str, map: &mut dyn FnMut(&str, &str) -> Document) -> Document {
        match self {
            Document::String(s) => map(path, s),
            Document::Map(m) => Document::Map(
                m.iter()
                    .map(|(key, value)| {
                        (key.clone(), value.map_strings(&join_path(path, key), map))
                    })
                    .collect(),
            ),
            Document::Seq(items) => Document::Seq(
                items
                    .iter()
                    .enumerate()
                    .map(|(index, value)| {
                        value.map_strings(&join_path(path, &index.to_string()), map)
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Document::Null => serde_json::Value::Null,
            Document::Bool(b) => serde_json::Value::Bool(*b),
            Document::Number(n) => serde_json::Value::Number(n.clone()),
            Document::String(s) => serde_json::Value::String(s.clone()),
            Document::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Document::Seq(items) => {
                serde_json::Value::Array(items.iter().map(Document::to_json).collect())
            }
        }
    }

    /// プロバイダーの型にデコード
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(self.to_json()).map_err(|e| DecodeError::new("$", e.to_string()))
    }

    /// シリアライズ可能な値からドキュメントを作成
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, DecodeError> {
        serde_json::to_value(value)
            .map(Document::from)
            .map_err(|e| DecodeError::new("$", e.to_string()))
    }

    /// YAML 文字列をパース
    pub fn from_yaml_str(content: &str) -> Result<Self, DecodeError> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|e| DecodeError::new("$", e.to_string()))?;
        from_yaml_value(value, "$")
    }
}

/// フィールドパスを連結
pub fn join_path(base: &str, segment: &str) -> String {
    if base.is_empty() {
        segment.to_string()
    } else {
        format!("{base}.{segment}")
    }
}

fn from_yaml_value(value: serde_yaml::Value, path: &str) -> Result<Document, DecodeError> {
    Ok(match value {
        serde_yaml::Value::Null => Document::Null,
        serde_yaml::Value::Bool(b) => Document::Bool(b),
        serde_yaml::Value::Number(n) => Document::Number(yaml_number(&n, path)?),
        serde_yaml::Value::String(s) => Document::String(s),
        serde_yaml::Value::Sequence(items) => Document::Seq(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| from_yaml_value(item, &format!("{path}[{i}]")))
                .collect::<Result<_, _>>()?,
        ),
        serde_yaml::Value::Mapping(entries) => {
            let mut mapping = Mapping::new();
            for (key, item) in entries {
                let key = yaml_key(key, path)?;
                let item = from_yaml_value(item, &format!("{path}.{key}"))?;
                mapping.insert(key, item);
            }
            Document::Map(mapping)
        }
        // タグは無視して中身のみを扱う
        serde_yaml::Value::Tagged(tagged) => from_yaml_value(tagged.value, path)?,
    })
}

fn yaml_number(n: &serde_yaml::Number, path: &str) -> Result<Number, DecodeError> {
    if let Some(i) = n.as_i64() {
        Ok(Number::from(i))
    } else if let Some(u) = n.as_u64() {
        Ok(Number::from(u))
    } else if let Some(f) = n.as_f64() {
        Number::from_f64(f)
            .ok_or_else(|| DecodeError::new(path, format!("数値として表現できません: {f}")))
    } else {
        Err(DecodeError::new(path, format!("不正な数値: {n}")))
    }
}

fn yaml_key(key: serde_yaml::Value, path: &str) -> Result<String, DecodeError> {
    match key {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(DecodeError::new(
            path,
            format!("マップのキーはスカラー値である必要があります: {other:?}"),
        )),
    }
}

impl TryFrom<serde_yaml::Value> for Document {
    type Error = DecodeError;

    fn try_from(value: serde_yaml::Value) -> Result<Self, Self::Error> {
        from_yaml_value(value, "$")
    }
}

impl From<serde_json::Value> for Document {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Document::Null,
            serde_json::Value::Bool(b) => Document::Bool(b),
            serde_json::Value::Number(n) => Document::Number(n),
            serde_json::Value::String(s) => Document::String(s),
            serde_json::Value::Array(items) => {
                Document::Seq(items.into_iter().map(Document::from).collect())
            }
            serde_json::Value::Object(entries) => Document::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Document::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Document {
    fn from(value: &str) -> Self {
        Document::String(value.to_string())
    }
}

impl From<String> for Document {
    fn from(value: String) -> Self {
        Document::String(value)
    }
}

impl From<bool> for Document {
    fn from(value: bool) -> Self {
        Document::Bool(value)
    }
}

impl From<i64> for Document {
    fn from(value: i64) -> Self {
        Document::Number(Number::from(value))
    }
}

impl From<Mapping> for Document {
    fn from(value: Mapping) -> Self {
        Document::Map(value)
    }
}

impl From<Vec<Document>> for Document {
    fn from(value: Vec<Document>) -> Self {
        Document::Seq(value)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Document::Null => serializer.serialize_unit(),
            Document::Bool(b) => serializer.serialize_bool(*b),
            Document::Number(n) => n.serialize(serializer),
            Document::String(s) => serializer.serialize_str(s),
            Document::Map(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (key, value) in m.iter() {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Document::Seq(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        Document::try_from(value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_yaml_preserves_key_order() {
        let doc = Document::from_yaml_str("zeta: 1\nalpha: 2\nmid: 3\n").unwrap();
        let keys: Vec<&str> = doc.as_map().unwrap().keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_insert_existing_key_keeps_position() {
        let mut mapping = Mapping::new();
        mapping.insert("a", Document::from(1));
        mapping.insert("b", Document::from(2));
        let old = mapping.insert("a", Document::from(3));

        assert_eq!(old, Some(Document::from(1)));
        assert_eq!(mapping.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(mapping.get("a"), Some(&Document::from(3)));
    }

    #[test]
    fn test_pointer() {
        let doc = Document::from_yaml_str(
            r#"
endpoint:
  host: 10.0.0.5
  ports: [5432, 6432]
"#,
        )
        .unwrap();

        assert_eq!(
            doc.pointer("endpoint.host").and_then(Document::as_str),
            Some("10.0.0.5")
        );
        assert_eq!(
            doc.pointer("endpoint.ports.1").and_then(Document::as_i64),
            Some(6432)
        );
        assert!(doc.pointer("endpoint.missing").is_none());
        assert!(doc.pointer("endpoint.host.deeper").is_none());
    }

    #[test]
    fn test_map_strings_passes_paths() {
        let doc = Document::from_yaml_str("env:\n  KEY: a\nargs: [b, 3]\n").unwrap();
        let mut seen = Vec::new();
        let mapped = doc.map_strings("", &mut |path, value| {
            seen.push(path.to_string());
            Document::from(value.to_uppercase())
        });

        assert_eq!(seen, vec!["env.KEY", "args.0"]);
        assert_eq!(mapped.pointer("env.KEY"), Some(&Document::from("A")));
        assert_eq!(mapped.pointer("args.1"), Some(&Document::from(3)));
    }

    #[test]
    fn test_decode_typed() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Scale {
            min: u32,
            max: u32,
        }

        let doc = Document::from_yaml_str("min: 1\nmax: 5\n").unwrap();
        let scale: Scale = doc.decode().unwrap();
        assert_eq!(scale, Scale { min: 1, max: 5 });

        let bad = Document::from_yaml_str("min: one\n").unwrap();
        assert!(bad.decode::<Scale>().is_err());
    }

    #[test]
    fn test_render_scalar() {
        assert_eq!(Document::from("x").render_scalar(), Some("x".to_string()));
        assert_eq!(Document::from(42).render_scalar(), Some("42".to_string()));
        assert_eq!(Document::from(true).render_scalar(), Some("true".to_string()));
        assert_eq!(Document::Null.render_scalar(), None);
        assert_eq!(Document::map().render_scalar(), None);
    }

    #[test]
    fn test_json_roundtrip_keeps_values() {
        let doc = Document::from_yaml_str("name: api\nreplicas: 3\ntags: [a, b]\n").unwrap();
        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get("replicas"), Some(&Document::from(3)));
        assert_eq!(back.get("tags").and_then(Document::as_seq).map(|s| s.len()), Some(2));
    }

    #[test]
    fn test_non_scalar_key_is_rejected() {
        let result = Document::from_yaml_str("? [a, b]\n: value\n");
        assert!(result.is_err());
    }
}
