//! 增量式 XML 片段分词器。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 客户端命令以没有长度前缀的 XML 片段流到达，一次读取可能停在任何字节上：
//!   标签中间、属性值中间、实体引用中间甚至多字节字符中间；
//! - 分词器只在看到完整记号时才产出事件，并报告消耗的字节数；其余字节留在
//!   入站缓冲里，等下一次读取补齐。因此无论输入如何切分，命令看到的内容都相同。
//!
//! ## 逻辑 (How)
//! - `<` 开头：在引号之外寻找 `>`，找不到则等待更多输入；
//! - 文本：读到下一个 `<` 为止；若缓冲里还没有 `<`，只产出到最后一个
//!   未闭合实体引用与最后一个完整 UTF-8 字符之前的部分；
//! - 注释与处理指令被跳过，CDATA 作为文本产出，DOCTYPE 一律拒绝；
//! - 自闭合标签产出 `Start` 后，下一次调用不消耗输入地补上 `End`；
//! - 维护打开元素栈，结束标签必须与栈顶匹配。
//!
//! ## 契约 (What)
//! - `next_event(input)`：`Ok(Some((event, consumed)))`、`Ok(None)`（需要更多输入）
//!   或 [`XmlError`]（帧错误，连接应当结束）。

use super::{Attributes, XmlError, XmlEvent};
use std::borrow::Cow;

const COMMENT_OPEN: &[u8] = b"<!--";
const CDATA_OPEN: &[u8] = b"<![CDATA[";
const DOCTYPE_OPEN: &[u8] = b"<!DOCTYPE";

#[derive(Debug, Default)]
pub struct Tokenizer {
    open: Vec<String>,
    pending_end: Option<String>,
}

impl Tokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前打开的元素层数。
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    pub fn next_event(&mut self, input: &[u8]) -> Result<Option<(XmlEvent, usize)>, XmlError> {
        if let Some(name) = self.pending_end.take() {
            return Ok(Some((XmlEvent::End { name }, 0)));
        }
        let mut skipped = 0;
        loop {
            let rest = &input[skipped..];
            if rest.is_empty() {
                return Ok(None);
            }
            if rest[0] != b'<' {
                return Ok(text_event(rest)?.map(|(event, used)| (event, skipped + used)));
            }
            if rest.len() < 2 {
                return Ok(None);
            }
            match rest[1] {
                b'?' => match find(rest, b"?>", 2) {
                    Some(end) => skipped += end + 2,
                    None => return Ok(None),
                },
                b'!' => {
                    if needs_more(rest, COMMENT_OPEN)
                        || needs_more(rest, CDATA_OPEN)
                        || needs_more(rest, DOCTYPE_OPEN)
                    {
                        return Ok(None);
                    }
                    if rest.starts_with(COMMENT_OPEN) {
                        match find(rest, b"-->", COMMENT_OPEN.len()) {
                            Some(end) => skipped += end + 3,
                            None => return Ok(None),
                        }
                    } else if rest.starts_with(CDATA_OPEN) {
                        let Some(end) = find(rest, b"]]>", CDATA_OPEN.len()) else {
                            return Ok(None);
                        };
                        let text = decode(&rest[CDATA_OPEN.len()..end])?;
                        return Ok(Some((XmlEvent::Text(text.to_owned()), skipped + end + 3)));
                    } else if rest.starts_with(DOCTYPE_OPEN) {
                        return Err(XmlError::Doctype);
                    } else {
                        return Err(XmlError::Malformed("unsupported markup declaration".into()));
                    }
                }
                b'/' => {
                    let Some(end) = find(rest, b">", 2) else {
                        return Ok(None);
                    };
                    let name = decode(&rest[2..end])?.trim_end();
                    validate_name(name)?;
                    self.close(name)?;
                    let event = XmlEvent::End {
                        name: name.to_owned(),
                    };
                    return Ok(Some((event, skipped + end + 1)));
                }
                _ => {
                    let Some(end) = tag_end(rest) else {
                        return Ok(None);
                    };
                    let (event, self_closing) = parse_start(&rest[1..end])?;
                    if let XmlEvent::Start { name, .. } = &event {
                        if self_closing {
                            self.pending_end = Some(name.clone());
                        } else {
                            self.open.push(name.clone());
                        }
                    }
                    return Ok(Some((event, skipped + end + 1)));
                }
            }
        }
    }

    fn close(&mut self, name: &str) -> Result<(), XmlError> {
        match self.open.pop() {
            Some(expected) if expected == name => Ok(()),
            Some(expected) => Err(XmlError::Mismatched {
                expected,
                found: name.to_owned(),
            }),
            None => Err(XmlError::UnexpectedClose(name.to_owned())),
        }
    }
}

fn needs_more(input: &[u8], prefix: &[u8]) -> bool {
    input.len() < prefix.len() && prefix.starts_with(input)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// 引号之外第一个 `>` 的位置。
fn tag_end(input: &[u8]) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (index, &byte) in input.iter().enumerate().skip(1) {
        match (quote, byte) {
            (Some(q), b) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(byte),
            (None, b'>') => return Some(index),
            (None, _) => {}
        }
    }
    None
}

fn text_event(input: &[u8]) -> Result<Option<(XmlEvent, usize)>, XmlError> {
    let end = match input.iter().position(|&b| b == b'<') {
        Some(end) => end,
        None => {
            // 不完整的实体引用留到下一次。
            let safe = match input.iter().rposition(|&b| b == b'&') {
                Some(amp) if !input[amp..].contains(&b';') => amp,
                _ => input.len(),
            };
            // 不完整的多字节字符同样留到下一次。
            let safe = match std::str::from_utf8(&input[..safe]) {
                Ok(_) => safe,
                Err(err) if err.error_len().is_none() => err.valid_up_to(),
                Err(_) => return Err(XmlError::InvalidUtf8),
            };
            if safe == 0 {
                return Ok(None);
            }
            safe
        }
    };
    let text = unescape(decode(&input[..end])?)?;
    Ok(Some((XmlEvent::Text(text.into_owned()), end)))
}

fn decode(bytes: &[u8]) -> Result<&str, XmlError> {
    std::str::from_utf8(bytes).map_err(|_| XmlError::InvalidUtf8)
}

fn parse_start(inner: &[u8]) -> Result<(XmlEvent, bool), XmlError> {
    let (inner, self_closing) = match inner.strip_suffix(b"/") {
        Some(stripped) => (stripped, true),
        None => (inner, false),
    };
    let text = decode(inner)?;
    let name_end = text
        .find(|c: char| c.is_ascii_whitespace())
        .unwrap_or(text.len());
    let name = &text[..name_end];
    validate_name(name)?;

    let mut attributes = Attributes::default();
    let mut rest = text[name_end..].trim_start();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| XmlError::Malformed(format!("attribute without value in <{name}>")))?;
        let key = rest[..eq].trim_end();
        validate_name(key)?;
        let after = rest[eq + 1..].trim_start();
        let quote = after
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| XmlError::Malformed(format!("unquoted attribute '{key}' in <{name}>")))?;
        let close = after[1..]
            .find(quote)
            .ok_or_else(|| XmlError::Malformed(format!("unterminated attribute '{key}'")))?;
        let raw = &after[1..1 + close];
        if raw.contains('<') {
            return Err(XmlError::Malformed(format!("'<' in attribute '{key}'")));
        }
        if attributes.get(key).is_some() {
            return Err(XmlError::DuplicateAttribute(key.to_owned()));
        }
        attributes.push(key.to_owned(), unescape(raw)?.into_owned());
        let remainder = &after[close + 2..];
        if !remainder.is_empty() && !remainder.starts_with(|c: char| c.is_ascii_whitespace()) {
            return Err(XmlError::Malformed(format!(
                "missing whitespace after attribute '{key}'"
            )));
        }
        rest = remainder.trim_start();
    }

    Ok((
        XmlEvent::Start {
            name: name.to_owned(),
            attributes,
        },
        self_closing,
    ))
}

fn validate_name(name: &str) -> Result<(), XmlError> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == ':');
    if valid_first
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | ':' | '-' | '.'))
    {
        Ok(())
    } else {
        Err(XmlError::Malformed(format!("invalid name '{name}'")))
    }
}

/// 展开预定义实体与字符引用。
pub fn unescape(text: &str) -> Result<Cow<'_, str>, XmlError> {
    if !text.contains('&') {
        return Ok(Cow::Borrowed(text));
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp + 1..];
        let semi = tail
            .find(';')
            .ok_or_else(|| XmlError::UnknownEntity(tail.chars().take(8).collect()))?;
        let reference = &tail[..semi];
        let resolved = match reference {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => char_reference(reference)
                .ok_or_else(|| XmlError::UnknownEntity(reference.to_owned()))?,
        };
        out.push(resolved);
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    Ok(Cow::Owned(out))
}

fn char_reference(reference: &str) -> Option<char> {
    let digits = reference.strip_prefix('#')?;
    let code = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    char::from_u32(code)
}
