//! 扩展点贡献
//!
//! 模块在描述中声明对其他模块命名扩展点的贡献（[`Contribution`]）。贡献者解析后
//! 贡献才被提交；目标已解析时立即登记，否则进入目标名下的等待队列，目标解析后
//! 按提交顺序登记。目标回退或卸载时已登记的贡献退回等待队列；贡献者回退或卸载时
//! 它的贡献全部撤回。
//!
//! 目标模块在钩子中通过 `ModuleContext::extensions` 读取已登记的贡献。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::module::metadata::{Contribution, ModuleIdentity};

/// 已提交的贡献
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    /// 提交序号，决定同一目标下的顺序
    pub sequence: u64,
    /// 贡献者
    pub contributor: ModuleIdentity,
    /// 目标模块
    pub target: ModuleIdentity,
    /// 扩展点名
    pub point: String,
    /// 贡献内容
    pub payload: serde_json::Value,
}

/// 一次登记状态变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionChange {
    /// 已登记到目标
    Registered(Extension),
    /// 进入等待队列
    Pending(Extension),
    /// 已撤回
    Unregistered(Extension),
}

impl ExtensionChange {
    pub fn extension(&self) -> &Extension {
        match self {
            ExtensionChange::Registered(e)
            | ExtensionChange::Pending(e)
            | ExtensionChange::Unregistered(e) => e,
        }
    }
}

/// 扩展登记表
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    /// 目标 -> 已登记的贡献，按序号排列
    registered: BTreeMap<ModuleIdentity, Vec<Extension>>,
    /// 目标 -> 等待中的贡献，按序号排列
    pending: BTreeMap<ModuleIdentity, Vec<Extension>>,
    /// 贡献者 -> 目标
    targets_of: BTreeMap<ModuleIdentity, BTreeSet<ModuleIdentity>>,
    next_sequence: u64,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 提交贡献者声明的全部贡献
    ///
    /// `target_ready` 判断目标是否已解析。同一贡献者重复提交时不做任何事。
    pub fn offer(
        &mut self,
        contributor: &ModuleIdentity,
        contributions: &[Contribution],
        target_ready: impl Fn(&ModuleIdentity) -> bool,
    ) -> Vec<ExtensionChange> {
        if contributions.is_empty() || self.targets_of.contains_key(contributor) {
            return Vec::new();
        }

        let mut changes = Vec::with_capacity(contributions.len());
        for contribution in contributions {
            self.next_sequence += 1;
            let extension = Extension {
                sequence: self.next_sequence,
                contributor: contributor.clone(),
                target: contribution.target.clone(),
                point: contribution.point.clone(),
                payload: contribution.payload.clone(),
            };
            self.targets_of
                .entry(contributor.clone())
                .or_default()
                .insert(extension.target.clone());

            if target_ready(&extension.target) {
                self.registered
                    .entry(extension.target.clone())
                    .or_default()
                    .push(extension.clone());
                changes.push(ExtensionChange::Registered(extension));
            } else {
                self.pending
                    .entry(extension.target.clone())
                    .or_default()
                    .push(extension.clone());
                changes.push(ExtensionChange::Pending(extension));
            }
        }
        changes
    }

    /// 撤回贡献者的全部贡献，无论已登记还是在等待
    pub fn withdraw(&mut self, contributor: &ModuleIdentity) -> Vec<ExtensionChange> {
        let Some(targets) = self.targets_of.remove(contributor) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        for target in &targets {
            for map in [&mut self.registered, &mut self.pending] {
                if let Some(list) = map.get_mut(target) {
                    let (gone, kept): (Vec<Extension>, Vec<Extension>) = list
                        .drain(..)
                        .partition(|e| &e.contributor == contributor);
                    *list = kept;
                    if list.is_empty() {
                        map.remove(target);
                    }
                    removed.extend(gone);
                }
            }
        }
        removed.sort_by_key(|e| e.sequence);
        removed.into_iter().map(ExtensionChange::Unregistered).collect()
    }

    /// 目标已解析：登记它名下等待中的贡献
    pub fn target_ready(&mut self, target: &ModuleIdentity) -> Vec<ExtensionChange> {
        let Some(waiting) = self.pending.remove(target) else {
            return Vec::new();
        };
        let list = self.registered.entry(target.clone()).or_default();
        list.extend(waiting.iter().cloned());
        list.sort_by_key(|e| e.sequence);
        waiting.into_iter().map(ExtensionChange::Registered).collect()
    }

    /// 目标回退或卸载：已登记的贡献退回等待队列
    pub fn target_unavailable(&mut self, target: &ModuleIdentity) -> Vec<ExtensionChange> {
        let Some(registered) = self.registered.remove(target) else {
            return Vec::new();
        };
        let list = self.pending.entry(target.clone()).or_default();
        list.extend(registered.iter().cloned());
        list.sort_by_key(|e| e.sequence);
        registered.into_iter().map(ExtensionChange::Pending).collect()
    }

    /// 目标名下已登记的贡献
    pub fn registered_for(&self, target: &ModuleIdentity) -> &[Extension] {
        self.registered.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 目标名下等待中的贡献
    pub fn pending_for(&self, target: &ModuleIdentity) -> &[Extension] {
        self.pending.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 目标扩展点上已登记的贡献
    pub fn contributions_to(&self, target: &ModuleIdentity, point: &str) -> Vec<&Extension> {
        self.registered_for(target)
            .iter()
            .filter(|e| e.point == point)
            .collect()
    }

    /// 全部等待中的贡献：目标 -> 贡献
    pub fn pending(&self) -> &BTreeMap<ModuleIdentity, Vec<Extension>> {
        &self.pending
    }

    /// 贡献者是否已提交
    pub fn has_offered(&self, contributor: &ModuleIdentity) -> bool {
        self.targets_of.contains_key(contributor)
    }
}
