//! 选择性同步过滤规则
//!
//! rclone 按顺序匹配过滤规则，第一条命中的规则生效，所以输出顺序必须与文件夹列表一致。

use crate::config::{SyncMode, SyncSettings};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Include,
    Exclude,
}

/// 单条过滤规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterRule {
    pub action: FilterAction,
    pub pattern: String,
}

impl FilterRule {
    pub fn include(pattern: impl Into<String>) -> Self {
        Self {
            action: FilterAction::Include,
            pattern: pattern.into(),
        }
    }

    pub fn exclude(pattern: impl Into<String>) -> Self {
        Self {
            action: FilterAction::Exclude,
            pattern: pattern.into(),
        }
    }

    /// 转换为 rclone 命令行参数
    pub fn to_arg(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action {
            FilterAction::Include => write!(f, "--include={}", self.pattern),
            FilterAction::Exclude => write!(f, "--exclude={}", self.pattern),
        }
    }
}

/// 根据同步模式生成过滤规则
pub fn compile_filters(mode: SyncMode, included: &[String], excluded: &[String]) -> Vec<FilterRule> {
    match mode {
        SyncMode::Full => Vec::new(),
        SyncMode::Include => {
            let mut rules = Vec::with_capacity(included.len() * 2 + 1);
            for folder in included {
                rules.push(FilterRule::include(format!("{}/**", folder)));
                rules.push(FilterRule::include(folder.as_str()));
            }
            // 空列表等同于全量同步，不能加兜底排除
            if !included.is_empty() {
                rules.push(FilterRule::exclude("*"));
            }
            rules
        }
        SyncMode::Exclude => excluded
            .iter()
            .flat_map(|folder| {
                [
                    FilterRule::exclude(format!("{}/**", folder)),
                    FilterRule::exclude(folder.as_str()),
                ]
            })
            .collect(),
    }
}

/// 使用设置中的模式和文件夹列表生成规则
pub fn compile_for(settings: &SyncSettings) -> Vec<FilterRule> {
    compile_filters(
        settings.sync_mode,
        &settings.included_folders,
        &settings.excluded_folders,
    )
}

pub fn to_args(rules: &[FilterRule]) -> Vec<String> {
    rules.iter().map(FilterRule::to_arg).collect()
}
