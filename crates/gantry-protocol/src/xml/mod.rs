//! XML 片段的分词、事件与转义。

mod escape;
mod tokenizer;

pub use escape::{escape, text_element};
pub use tokenizer::{Tokenizer, unescape};

use thiserror::Error;

/// 有序属性表；按出现顺序保存，查找为线性扫描（属性通常只有几个）。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn push(&mut self, name: String, value: String) {
        self.0.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// 取非空属性值。
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|value| !value.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// 分词器产出的解析事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XmlEvent {
    Start { name: String, attributes: Attributes },
    End { name: String },
    Text(String),
}

/// 帧错误：客户端输入不是格式良好的 XML，连接随之结束。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum XmlError {
    #[error("invalid UTF-8 in client input")]
    InvalidUtf8,
    #[error("{0}")]
    Malformed(String),
    #[error("element '{found}' closed while '{expected}' is open")]
    Mismatched { expected: String, found: String },
    #[error("closing element '{0}' without an open element")]
    UnexpectedClose(String),
    #[error("unknown entity reference '&{0};'")]
    UnknownEntity(String),
    #[error("document type declarations are not accepted")]
    Doctype,
    #[error("duplicate attribute '{0}'")]
    DuplicateAttribute(String),
    #[error("text outside of any command")]
    StrayText,
}
