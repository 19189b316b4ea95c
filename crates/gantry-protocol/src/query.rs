//! 列表请求的查询描述与过滤表达式。
//!
//! 过滤文本由空白分隔的项组成，双引号可以包住含空白的值：
//!
//! | 项                 | 含义                         |
//! |--------------------|------------------------------|
//! | `first=N`          | 从第 N 行开始（1 起）         |
//! | `rows=N`           | 每页 N 行，`-1` 表示不限      |
//! | `sort=F`           | 按列 F 升序                   |
//! | `sort-reverse=F`   | 按列 F 降序                   |
//! | `F=V`              | 列 F 等于 V（不区分大小写）   |
//! | `F~V`              | 列 F 包含 V（不区分大小写）   |
//! | `word`             | `name` 或 `comment` 包含 word |
//!
//! 后出现的分页与排序关键字覆盖先出现的。

use crate::store::ResourceRow;
use std::cmp::Ordering;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    Equals { field: String, value: String },
    Contains { field: String, value: String },
    Keyword(String),
}

impl Condition {
    fn matches(&self, row: &dyn ResourceRow) -> bool {
        match self {
            Self::Equals { field, value } => row
                .field(field)
                .is_some_and(|actual| actual.eq_ignore_ascii_case(value)),
            Self::Contains { field, value } => row
                .field(field)
                .is_some_and(|actual| contains_ignore_case(&actual, value)),
            Self::Keyword(word) => ["name", "comment"].iter().any(|field| {
                row.field(field)
                    .is_some_and(|actual| contains_ignore_case(&actual, word))
            }),
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Equals { field, value } => format!("{field}={}", quote(value)),
            Self::Contains { field, value } => format!("{field}~{}", quote(value)),
            Self::Keyword(word) => quote(word),
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn quote(value: &str) -> String {
    if value.contains(char::is_whitespace) || value.is_empty() {
        format!("\"{value}\"")
    } else {
        value.to_owned()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub ascending: bool,
}

impl Default for Sort {
    fn default() -> Self {
        Self {
            field: "name".to_owned(),
            ascending: true,
        }
    }
}

impl Sort {
    /// 按排序列比较两行；两个值都是整数时按数值比较。
    pub fn compare(&self, a: &dyn ResourceRow, b: &dyn ResourceRow) -> Ordering {
        let left = a.field(&self.field).unwrap_or_default();
        let right = b.field(&self.field).unwrap_or_default();
        let ordering = match (left.parse::<i64>(), right.parse::<i64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            _ => left.to_lowercase().cmp(&right.to_lowercase()),
        };
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

/// 分页：`first` 从 1 起；`max < 0` 表示不限。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub first: u64,
    pub max: i64,
}

impl Page {
    pub fn is_unbounded(&self) -> bool {
        self.max < 0
    }

    /// 跳过的行数。
    pub fn skip(&self) -> u64 {
        self.first.saturating_sub(1)
    }
}

/// 解析后的过滤表达式。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
    pub first: Option<u64>,
    pub rows: Option<i64>,
    pub sort: Option<Sort>,
}

impl Filter {
    pub fn parse(text: &str) -> Self {
        let mut filter = Self::default();
        for term in split_terms(text) {
            filter.absorb(&term);
        }
        filter
    }

    /// 依次叠加多段过滤文本（保存的过滤器在前，请求里的文本在后）。
    pub fn parse_all<'a>(texts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut filter = Self::default();
        for text in texts {
            for term in split_terms(text) {
                filter.absorb(&term);
            }
        }
        filter
    }

    fn absorb(&mut self, term: &str) {
        if let Some((field, value)) = term.split_once('=') {
            let value = unquote(value);
            match field {
                "first" => self.first = value.parse::<i64>().ok().map(|n| n.max(1) as u64),
                "rows" => self.rows = value.parse().ok(),
                "sort" => {
                    self.sort = Some(Sort {
                        field: value.to_owned(),
                        ascending: true,
                    })
                }
                "sort-reverse" => {
                    self.sort = Some(Sort {
                        field: value.to_owned(),
                        ascending: false,
                    })
                }
                _ if field.is_empty() => {}
                _ => self.conditions.push(Condition::Equals {
                    field: field.to_owned(),
                    value: value.to_owned(),
                }),
            }
        } else if let Some((field, value)) = term.split_once('~') {
            if !field.is_empty() {
                self.conditions.push(Condition::Contains {
                    field: field.to_owned(),
                    value: unquote(value).to_owned(),
                });
            }
        } else {
            let word = unquote(term);
            if !word.is_empty() {
                self.conditions.push(Condition::Keyword(word.to_owned()));
            }
        }
    }

    pub fn matches(&self, row: &dyn ResourceRow) -> bool {
        self.conditions.iter().all(|condition| condition.matches(row))
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// 按空白切分，双引号内的空白不切分。
fn split_terms(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in text.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    terms.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        terms.push(current);
    }
    terms
}

/// 一次列表请求的全部查询参数，由开始标签的属性一次性构造，之后不可变。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryDescriptor {
    pub resource_type: String,
    pub id: Option<String>,
    pub filter_id: Option<String>,
    pub conditions: Vec<Condition>,
    pub sort: Sort,
    pub page: Page,
    pub include_trash: bool,
}

impl QueryDescriptor {
    /// 不带任何条件的查询。
    pub fn all(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: None,
            filter_id: None,
            conditions: Vec::new(),
            sort: Sort::default(),
            page: Page { first: 1, max: -1 },
            include_trash: false,
        }
    }

    /// 去掉过滤条件与 id 后的查询，用于统计总数。
    pub fn unfiltered(&self) -> Self {
        Self {
            id: None,
            conditions: Vec::new(),
            ..self.clone()
        }
    }

    /// 行是否满足 id、回收站与过滤条件（不考虑分页）。
    pub fn matches(&self, row: &dyn ResourceRow, in_trash: bool) -> bool {
        if in_trash && !self.include_trash {
            return false;
        }
        if let Some(id) = &self.id
            && row.id() != id
        {
            return false;
        }
        self.conditions
            .iter()
            .all(|condition| condition.matches(row))
    }

    /// 规范化的过滤文本，随列表响应回显给客户端。
    pub fn canonical_term(&self) -> String {
        let mut parts: Vec<String> = self.conditions.iter().map(Condition::render).collect();
        parts.push(format!("first={}", self.page.first));
        parts.push(format!("rows={}", self.page.max));
        let key = if self.sort.ascending {
            "sort"
        } else {
            "sort-reverse"
        };
        parts.push(format!("{key}={}", self.sort.field));
        parts.join(" ")
    }
}
