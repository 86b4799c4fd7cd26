//! 工具注册表
//!
//! 所有会话协商得到的工具汇总为一个按名索引、保持注册顺序的目录（Catalog）。
//! 读多写少：查找只克隆一次 Arc；重建时构造完整新目录后整体替换，读者只会看到旧目录或新目录。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;

use crate::core::ProtocolError;
use crate::protocol::WireTool;

/// 工具定义：名称（注册表内唯一）、描述、参数 schema、来源会话
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub origin: String,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            origin: origin.into(),
        }
    }

    pub fn from_wire(tool: WireTool, origin: &str) -> Self {
        Self {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            input_schema: tool.input_schema,
            origin: origin.to_string(),
        }
    }
}

/// 不可变目录快照
#[derive(Debug, Default)]
struct Catalog {
    order: Vec<ToolDefinition>,
    index: HashMap<String, usize>,
}

impl Catalog {
    fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.index.get(name).map(|&i| &self.order[i])
    }

    /// 插入；同名同 schema 视为重复注册（保留原定义），schema 不同则冲突
    fn insert(&mut self, def: ToolDefinition) -> Result<bool, ProtocolError> {
        if let Some(existing) = self.get(&def.name) {
            if existing.input_schema != def.input_schema {
                return Err(ProtocolError::SchemaConflict(def.name));
            }
            return Ok(false);
        }
        self.index.insert(def.name.clone(), self.order.len());
        self.order.push(def);
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    catalog: RwLock<Arc<Catalog>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<Catalog> {
        self.catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn swap(&self, next: Catalog) {
        *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
    }

    /// 注册单个工具；同名但 schema 不同返回 SchemaConflict
    pub fn register(&self, def: ToolDefinition) -> Result<(), ProtocolError> {
        let mut guard = self.catalog.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = guard.get(&def.name) {
            if existing.input_schema != def.input_schema {
                return Err(ProtocolError::SchemaConflict(def.name));
            }
            return Ok(());
        }
        let mut next = Catalog {
            order: guard.order.clone(),
            index: guard.index.clone(),
        };
        next.insert(def)?;
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<ToolDefinition> {
        self.snapshot().get(name).cloned()
    }

    /// 按注册顺序列出所有工具
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.snapshot().order.clone()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.snapshot().order.iter().map(|d| d.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 整体重建：按给定顺序构造新目录后一次性替换；冲突的定义被跳过并返回其名称
    pub fn rebuild(&self, defs: impl IntoIterator<Item = ToolDefinition>) -> Vec<String> {
        let mut next = Catalog::default();
        let mut conflicts = Vec::new();
        for def in defs {
            let (name, origin) = (def.name.clone(), def.origin.clone());
            if let Err(e) = next.insert(def) {
                tracing::warn!(tool = %name, server = %origin, error = %e, "skipping conflicting tool");
                conflicts.push(name);
            }
        }
        tracing::debug!(tools = next.order.len(), "tool registry rebuilt");
        self.swap(next);
        conflicts
    }

    /// 用 origin 的新清单替换其旧工具（其余来源保持原顺序），整体重建
    pub fn replace_origin(&self, origin: &str, defs: Vec<ToolDefinition>) -> Vec<String> {
        let current = self.snapshot();
        let kept = current
            .order
            .iter()
            .filter(|d| d.origin != origin)
            .cloned()
            .collect::<Vec<_>>();
        self.rebuild(kept.into_iter().chain(defs))
    }

    /// 移除某个来源的全部工具（会话断开时）
    pub fn remove_origin(&self, origin: &str) -> Vec<String> {
        self.replace_origin(origin, Vec::new())
    }
}
