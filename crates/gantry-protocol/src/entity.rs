use crate::xml::{Attributes, XmlEvent};

/// 命令体中的一个元素节点。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entity {
    pub name: String,
    pub attributes: Attributes,
    pub text: String,
    pub children: Vec<Entity>,
}

impl Entity {
    pub fn new(name: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            name: name.into(),
            attributes,
            text: String::new(),
            children: Vec::new(),
        }
    }

    pub fn child(&self, name: &str) -> Option<&Entity> {
        self.children.iter().find(|child| child.name == name)
    }

    /// 沿路径逐级查找第一个同名子节点。
    pub fn descendant(&self, path: &[&str]) -> Option<&Entity> {
        path.iter().try_fold(self, |node, name| node.child(name))
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name)
    }

    pub fn trimmed_text(&self) -> &str {
        self.text.trim()
    }

    /// 包含自身在内的节点总数。
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Entity::node_count).sum::<usize>()
    }
}

/// 命令体累积器：把跨越多次读取的解析事件拼成一棵实体树。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 第一个 `Start` 事件成为根节点；
/// - `Text` 追加到当前最内层元素；
/// - `End` 弹出当前元素并挂到父节点下；根节点弹出时 `is_completed()` 变为真；
/// - 完成后再收到的事件被忽略（引擎在完成时立即取走实体树）。
#[derive(Debug, Default)]
pub struct CommandContext {
    element_stack: Vec<Entity>,
    root: Option<Entity>,
}

impl CommandContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, event: XmlEvent) {
        if self.root.is_some() {
            return;
        }
        match event {
            XmlEvent::Start { name, attributes } => {
                self.element_stack.push(Entity::new(name, attributes));
            }
            XmlEvent::Text(text) => {
                if let Some(current) = self.element_stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            XmlEvent::End { .. } => {
                let Some(node) = self.element_stack.pop() else {
                    return;
                };
                match self.element_stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => self.root = Some(node),
                }
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.root.is_some()
    }

    /// 当前打开的元素层数。
    #[cfg(test)]
    fn depth(&self) -> usize {
        self.element_stack.len()
    }

    pub fn root(&self) -> Option<&Entity> {
        self.root.as_ref()
    }

    pub fn into_root(self) -> Option<Entity> {
        self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(name: &str) -> XmlEvent {
        XmlEvent::Start {
            name: name.into(),
            attributes: Attributes::default(),
        }
    }

    fn end(name: &str) -> XmlEvent {
        XmlEvent::End { name: name.into() }
    }

    #[test]
    fn empty_element_completes_with_single_node() {
        let mut context = CommandContext::new();
        context.feed(start("authenticate"));
        assert!(!context.is_completed());
        context.feed(end("authenticate"));
        assert!(context.is_completed());
        assert_eq!(context.root().map(Entity::node_count), Some(1));
    }

    #[test]
    fn nested_body_builds_tree_and_joins_text() {
        let mut context = CommandContext::new();
        for event in [
            start("authenticate"),
            start("credentials"),
            start("username"),
            XmlEvent::Text("ad".into()),
            XmlEvent::Text("min".into()),
            end("username"),
            start("password"),
            XmlEvent::Text(" secret ".into()),
            end("password"),
            end("credentials"),
        ] {
            context.feed(event);
        }
        assert_eq!(context.depth(), 1);
        context.feed(end("authenticate"));

        let root = context.into_root().unwrap();
        assert_eq!(root.node_count(), 4);
        assert_eq!(
            root.descendant(&["credentials", "username"]).map(Entity::trimmed_text),
            Some("admin")
        );
        assert_eq!(
            root.descendant(&["credentials", "password"]).map(Entity::trimmed_text),
            Some("secret")
        );
    }
}
