//! 通用列表子协议。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 所有 `get_<plural>` 命令共用同一套流程：按查询描述取迭代器、跳过 `first`
//!   之前的行、输出至多 `max` 行、再附上计数；差异只在资源类型与列名；
//! - 迭代器只能前进，因此分页靠“先跳过再输出”，顺序完全由存储决定。
//!
//! ## 逻辑 (How)
//! 1. 由开始标签属性构造 [`QueryDescriptor`]（保存的过滤器文本在前，`filter`
//!    属性在后，后者的关键字覆盖前者）；
//! 2. 拉取并格式化本页的行；请求带 `id` 而迭代器为空时返回 404，且不计数；
//! 3. 计算 `filtered`（带 `id` 时直接为 1）与 `total`（去掉过滤条件）；
//! 4. 依次输出开始元素、各行、过滤器回显、分页、计数与结束元素。
//!
//! ## 契约 (What)
//! - 行在输出开始元素之前全部格式化完毕：迭代器中途失败时客户端只会看到
//!   一个完整的错误响应；
//! - 存储的 `NotFound`/`PermissionDenied`/其它失败分别映射为 404/403/500，
//!   只中止当前命令。

use crate::command::{CommandCx, CommandFailure, Services};
use crate::query::{Filter, Page, QueryDescriptor, Sort};
use crate::resources::ResourceKind;
use crate::response::{CommandError, STATUS_OK, close_response, open_response};
use crate::store::ResourceRow;
use crate::xml::{Attributes, escape, text_element};
use tracing::debug;
use uuid::Uuid;

/// 一次列表响应的计数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageSummary {
    /// 本页实际输出的行数。
    pub count: u64,
    pub filtered: u64,
    pub total: u64,
}

/// 校验 `*_id` 属性是 UUID。
pub fn validated_id<'a>(attributes: &'a Attributes, name: &str) -> Result<Option<&'a str>, CommandError> {
    match attributes.non_empty(name) {
        Some(id) if Uuid::parse_str(id).is_err() => {
            Err(CommandError::syntax(format!("Invalid {name}")))
        }
        other => Ok(other),
    }
}

fn numeric_attribute(attributes: &Attributes, name: &str) -> Result<Option<i64>, CommandError> {
    attributes
        .non_empty(name)
        .map(|value| {
            value
                .trim()
                .parse::<i64>()
                .map_err(|_| CommandError::syntax(format!("Invalid {name}")))
        })
        .transpose()
}

/// 只依赖属性的校验，在开始标签处执行。
pub fn check_attributes(kind: &ResourceKind, attributes: &Attributes) -> Result<(), CommandError> {
    validated_id(attributes, &kind.id_attribute())?;
    validated_id(attributes, "filt_id")?;
    numeric_attribute(attributes, "first")?;
    numeric_attribute(attributes, "max")?;
    Ok(())
}

/// 由开始标签属性构造查询描述。
pub fn build_query(
    kind: &ResourceKind,
    attributes: &Attributes,
    services: &Services,
) -> Result<QueryDescriptor, CommandError> {
    check_attributes(kind, attributes)?;
    let id = validated_id(attributes, &kind.id_attribute())?.map(str::to_owned);
    let filter_id = validated_id(attributes, "filt_id")?.map(str::to_owned);

    let saved = match &filter_id {
        Some(filter_id) => Some(
            services
                .store
                .saved_filter(filter_id)?
                .ok_or_else(|| CommandError::not_found("filter", filter_id))?,
        ),
        None => None,
    };
    let filter = Filter::parse_all(
        saved
            .as_deref()
            .into_iter()
            .chain(attributes.get("filter")),
    );

    let first = filter
        .first
        .or(numeric_attribute(attributes, "first")?.map(|n| n.max(1) as u64))
        .unwrap_or(1);
    let max = filter
        .rows
        .or(numeric_attribute(attributes, "max")?)
        .unwrap_or(services.settings.default_rows);
    let sort = filter.sort.clone().unwrap_or_else(|| Sort {
        field: attributes
            .non_empty("sort_field")
            .unwrap_or("name")
            .to_owned(),
        ascending: attributes.get("sort_order") != Some("descending"),
    });

    // 单个 id 的查询不分页。
    let page = if id.is_some() {
        Page { first: 1, max: -1 }
    } else {
        Page { first, max }
    };

    Ok(QueryDescriptor {
        resource_type: kind.name.to_owned(),
        id,
        filter_id,
        conditions: filter.conditions,
        sort,
        page,
        include_trash: attributes.get("trash") == Some("1"),
    })
}

fn format_row(kind: &ResourceKind, row: &dyn ResourceRow, include_trash: bool) -> String {
    let mut out = format!("<{} id=\"{}\">", kind.name, escape(row.id()));
    for column in kind.columns {
        out.push_str(&text_element(column, &row.field(column).unwrap_or_default()));
    }
    out.push_str(&text_element("owner", &row.field("owner").unwrap_or_default()));
    if include_trash {
        out.push_str(&text_element("trash", &row.field("trash").unwrap_or_default()));
    }
    out.push_str(&format!("</{}>", kind.name));
    out
}

/// 列出一种资源，返回本页计数。
pub async fn list_resources(
    kind: &ResourceKind,
    command: &str,
    attributes: &Attributes,
    cx: &mut CommandCx<'_>,
) -> Result<PageSummary, CommandFailure> {
    let services = cx.services;
    let query = build_query(kind, attributes, services)?;

    if let Some(id) = &query.id {
        let who = cx.session.who()?;
        if !services
            .authorizer
            .authorize_resource(who, command, kind.name, id)?
        {
            return Err(CommandError::permission_denied().into());
        }
    }

    let mut rows = services.store.iterate(&query)?;
    let mut seen_any = false;
    let mut skipped = 0u64;
    let mut formatted = Vec::new();
    while query.page.is_unbounded() || (formatted.len() as i64) < query.page.max {
        let Some(row) = rows.next_row()? else {
            break;
        };
        seen_any = true;
        if skipped < query.page.skip() {
            skipped += 1;
            continue;
        }
        formatted.push(format_row(kind, row.as_ref(), query.include_trash));
    }
    drop(rows);

    if let Some(id) = &query.id
        && !seen_any
    {
        return Err(CommandError::not_found(kind.name, id).into());
    }

    let filtered = if query.id.is_some() {
        1
    } else {
        services.store.count(&query)?
    };
    let total = services.store.count(&query.unfiltered())?;
    let summary = PageSummary {
        count: formatted.len() as u64,
        filtered,
        total,
    };

    cx.emit(&open_response(command, STATUS_OK, "OK")).await?;
    for row in &formatted {
        cx.emit(row).await?;
    }
    cx.emit(&format!(
        "<filters id=\"{}\">{}</filters>",
        escape(query.filter_id.as_deref().unwrap_or("")),
        text_element("term", &query.canonical_term())
    ))
    .await?;
    cx.emit(&format!(
        "<{} start=\"{}\" max=\"{}\"/>",
        kind.plural, query.page.first, query.page.max
    ))
    .await?;
    cx.emit(&format!(
        "<{}_count>{}<filtered>{}</filtered><page>{}</page></{}_count>",
        kind.name, summary.total, summary.filtered, summary.count, kind.name
    ))
    .await?;
    cx.emit(&close_response(command)).await?;

    debug!(
        command,
        count = summary.count,
        filtered = summary.filtered,
        total = summary.total,
        "listed resources"
    );
    Ok(summary)
}
