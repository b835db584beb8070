//! 模块解析器
//!
//! 把依赖图上的边转换为解析决策：
//!
//! - `try_resolve`：对候选模块反复求不动点，新解析的模块把它的依赖者和片段加入候选
//! - 循环检测：连续两轮没有进展时，在 INSTALLED 子图上用 Tarjan 求强连通分量，
//!   每个分量内取最短环，每个不同的环只报告一次，直到拓扑变化
//! - `start_order`：已解析模块的确定性拓扑顺序，依赖者多的模块优先，其次按标识排序
//!
//! 解析顺序与安装顺序无关：同一组模块无论以何种顺序安装，最终的解析结果和启动顺序相同。

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};

use tracing::{debug, trace, warn};

use crate::module::dependency::DependencyGraph;
use crate::module::lifecycle::{LifecycleController, ModuleTable};
use crate::module::metadata::{LifecycleState, ModuleIdentity};
use crate::utils::RuntimeError;

/// 一次解析的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolutionReport {
    /// 新解析的模块，按解析顺序
    pub resolved: Vec<ModuleIdentity>,
    /// 新附着的片段：(片段, 宿主)
    pub attached: Vec<(ModuleIdentity, ModuleIdentity)>,
    /// 新发现的循环
    pub cycles: Vec<Vec<ModuleIdentity>>,
}

impl ResolutionReport {
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.cycles.is_empty()
    }
}

/// 模块解析器
#[derive(Debug, Default)]
pub struct Resolver {
    /// 已报告的循环（已旋转到最小标识开头）
    reported_cycles: BTreeSet<Vec<ModuleIdentity>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试解析候选模块
    pub fn try_resolve(
        &mut self,
        candidates: impl IntoIterator<Item = ModuleIdentity>,
        graph: &DependencyGraph,
        lifecycle: &mut LifecycleController,
    ) -> ResolutionReport {
        let mut report = ResolutionReport::default();
        let mut queue: BTreeSet<ModuleIdentity> = candidates
            .into_iter()
            .filter(|id| lifecycle.state_of(id) == Some(LifecycleState::Installed))
            .filter(|id| graph.unresolved(id).is_empty())
            .collect();

        let mut idle_passes = 0;
        while !queue.is_empty() {
            let mut ready: Vec<ModuleIdentity> = queue
                .iter()
                .filter(|id| Self::can_resolve(id, graph, lifecycle))
                .cloned()
                .collect();

            if ready.is_empty() {
                idle_passes += 1;
                if idle_passes >= 2 {
                    break;
                }
                trace!(pending = queue.len(), "本轮没有可解析的模块，重试一次");
                continue;
            }
            idle_passes = 0;

            ready.sort_by(|a, b| {
                graph
                    .dependents(b)
                    .len()
                    .cmp(&graph.dependents(a).len())
                    .then_with(|| a.cmp(b))
            });

            for id in ready {
                queue.remove(&id);
                if !lifecycle.mark_resolved(&id) {
                    continue;
                }
                if let Some(host) = graph.fragment_host(&id) {
                    lifecycle.attach_fragment(&id, host);
                    report.attached.push((id.clone(), host.clone()));
                }
                debug!(module_id = %id, "模块已解析");

                for next in graph.dependents(&id).iter().chain(graph.fragments_of(&id)) {
                    if lifecycle.state_of(next) == Some(LifecycleState::Installed)
                        && graph.unresolved(next).is_empty()
                    {
                        queue.insert(next.clone());
                    }
                }
                report.resolved.push(id);
            }
        }

        if !queue.is_empty() {
            for cycle in find_cycles(graph, lifecycle.modules()) {
                if self.reported_cycles.insert(cycle.clone()) {
                    warn!(
                        cycle = %cycle.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> "),
                        "检测到循环依赖"
                    );
                    report.cycles.push(cycle);
                }
            }
        }

        report
    }

    /// 依赖和片段宿主都已满足
    fn can_resolve(
        id: &ModuleIdentity,
        graph: &DependencyGraph,
        lifecycle: &LifecycleController,
    ) -> bool {
        if lifecycle.state_of(id) != Some(LifecycleState::Installed)
            || !graph.unresolved(id).is_empty()
        {
            return false;
        }
        let requirements_met = graph
            .requires(id)
            .iter()
            .all(|dep| lifecycle.state_of(dep).map_or(false, |s| s.is_resolved()));
        let host_ready = match graph.fragment_host(id) {
            Some(host) => lifecycle.state_of(host).map_or(false, |s| s.is_resolved()),
            None => true,
        };
        requirements_met && host_ready
    }

    /// 拓扑变化：忘记涉及这些模块的循环，之后可以重新报告
    pub fn topology_changed<'a>(&mut self, touched: impl IntoIterator<Item = &'a ModuleIdentity>) {
        let touched: BTreeSet<&ModuleIdentity> = touched.into_iter().collect();
        self.reported_cycles
            .retain(|cycle| !cycle.iter().any(|id| touched.contains(id)));
    }

    /// 包含该模块的已报告循环
    pub fn cycle_containing(&self, id: &ModuleIdentity) -> Option<&Vec<ModuleIdentity>> {
        self.reported_cycles.iter().find(|cycle| cycle.contains(id))
    }

    /// 已报告的循环
    pub fn reported_cycles(&self) -> impl Iterator<Item = &Vec<ModuleIdentity>> {
        self.reported_cycles.iter()
    }

    /// 解释一个 INSTALLED 模块为何无法解析
    ///
    /// 模块已解析或不存在时返回 `None`。
    pub fn explain(
        &self,
        id: &ModuleIdentity,
        graph: &DependencyGraph,
        lifecycle: &LifecycleController,
    ) -> Option<RuntimeError> {
        if lifecycle.state_of(id)? != LifecycleState::Installed {
            return None;
        }

        let missing = graph.unresolved(id);
        if !missing.is_empty() {
            return Some(RuntimeError::MissingDependency {
                module: id.clone(),
                missing: missing.iter().cloned().collect(),
            });
        }

        if let Some(host) = graph.fragment_host(id) {
            if !lifecycle.state_of(host).map_or(false, |s| s.is_resolved()) {
                return Some(RuntimeError::FragmentHostUnavailable {
                    fragment: id.clone(),
                    host: host.clone(),
                });
            }
        }

        if let Some(cycle) = self.cycle_containing(id) {
            return Some(RuntimeError::CyclicDependency(cycle.clone()));
        }

        Some(RuntimeError::NotResolved {
            module: id.clone(),
            waiting_for: graph
                .requires(id)
                .iter()
                .filter(|dep| !lifecycle.state_of(dep).map_or(false, |s| s.is_resolved()))
                .cloned()
                .collect(),
        })
    }
}

/// 已解析非片段模块的启动顺序
///
/// Kahn 拓扑排序。多个模块同时就绪时，依赖者多的优先，其次按标识升序。
/// 对片段的依赖折算为对其宿主的依赖。
pub fn start_order(graph: &DependencyGraph, modules: &ModuleTable) -> Vec<ModuleIdentity> {
    let nodes: BTreeSet<&ModuleIdentity> = modules
        .values()
        .filter(|m| m.state().is_resolved() && !m.is_fragment())
        .map(|m| m.identity())
        .collect();
    topological_order(graph, nodes)
}

/// 只对 `subset` 中已解析的非片段模块排序
///
/// 子集之外的依赖视为已满足，耗时只与子集及其边数有关。
pub fn start_order_among(
    graph: &DependencyGraph,
    modules: &ModuleTable,
    subset: &BTreeSet<ModuleIdentity>,
) -> Vec<ModuleIdentity> {
    let nodes: BTreeSet<&ModuleIdentity> = subset
        .iter()
        .filter_map(|id| modules.get(id))
        .filter(|m| m.state().is_resolved() && !m.is_fragment())
        .map(|m| m.identity())
        .collect();
    topological_order(graph, nodes)
}

fn topological_order(graph: &DependencyGraph, nodes: BTreeSet<&ModuleIdentity>) -> Vec<ModuleIdentity> {
    let mut indegree: BTreeMap<&ModuleIdentity, usize> = nodes.iter().map(|id| (*id, 0)).collect();
    let mut edges: HashMap<&ModuleIdentity, Vec<&ModuleIdentity>> = HashMap::new();

    for id in &nodes {
        let mut seen = BTreeSet::new();
        for dep in graph.requires(id) {
            let target = graph.fragment_host(dep).unwrap_or(dep);
            if target == *id || !nodes.contains(target) || !seen.insert(target) {
                continue;
            }
            edges.entry(target).or_default().push(*id);
            if let Some(count) = indegree.get_mut(id) {
                *count += 1;
            }
        }
    }

    let mut heap: BinaryHeap<(usize, Reverse<&ModuleIdentity>)> = indegree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| (graph.dependents(id).len(), Reverse(*id)))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some((_, Reverse(id))) = heap.pop() {
        order.push(id.clone());
        for next in edges.get(id).into_iter().flatten() {
            if let Some(count) = indegree.get_mut(next) {
                *count -= 1;
                if *count == 0 {
                    heap.push((graph.dependents(next).len(), Reverse(*next)));
                }
            }
        }
    }

    if order.len() < nodes.len() {
        // 已解析模块之间不应存在环，这里只是兜底
        let placed: BTreeSet<ModuleIdentity> = order.iter().cloned().collect();
        order.extend(nodes.into_iter().filter(|id| !placed.contains(*id)).cloned());
    }
    order
}

// ============================================================================
// 循环检测
// ============================================================================

/// 在 INSTALLED 模块构成的子图上寻找循环
///
/// 每个强连通分量（含自环）给出一个最短环，环旋转到最小标识开头。
pub fn find_cycles(graph: &DependencyGraph, modules: &ModuleTable) -> Vec<Vec<ModuleIdentity>> {
    let nodes: Vec<&ModuleIdentity> = modules
        .values()
        .filter(|m| m.state() == LifecycleState::Installed)
        .map(|m| m.identity())
        .collect();
    let index: HashMap<&ModuleIdentity, usize> =
        nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let adjacency: Vec<Vec<usize>> = nodes
        .iter()
        .map(|id| {
            let mut targets: Vec<usize> = graph
                .requires(id)
                .iter()
                .chain(graph.fragment_host(id))
                .filter_map(|dep| index.get(dep).copied())
                .collect();
            targets.sort_unstable();
            targets.dedup();
            targets
        })
        .collect();

    let mut cycles = Vec::new();
    for component in Tarjan::run(&adjacency) {
        let is_cycle = component.len() > 1 || adjacency[component[0]].contains(&component[0]);
        if !is_cycle {
            continue;
        }
        if let Some(cycle) = shortest_cycle(&component, &adjacency) {
            cycles.push(rotate_to_min(
                cycle.into_iter().map(|i| nodes[i].clone()).collect(),
            ));
        }
    }
    cycles.sort();
    cycles
}

/// 分量内的最短环，多个等长时取起点最小者
fn shortest_cycle(component: &[usize], adjacency: &[Vec<usize>]) -> Option<Vec<usize>> {
    let members: BTreeSet<usize> = component.iter().copied().collect();
    let mut best: Option<Vec<usize>> = None;

    for &start in &members {
        if adjacency[start].contains(&start) {
            return Some(vec![start]);
        }

        // 从 start 出发 BFS，找回到 start 的最短路径
        let mut parent: HashMap<usize, usize> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut found = None;
        'bfs: while let Some(current) = queue.pop_front() {
            for &next in &adjacency[current] {
                if !members.contains(&next) {
                    continue;
                }
                if next == start {
                    found = Some(current);
                    break 'bfs;
                }
                if next != start && !parent.contains_key(&next) {
                    parent.insert(next, current);
                    queue.push_back(next);
                }
            }
        }

        if let Some(mut last) = found {
            let mut path = vec![last];
            while last != start {
                last = parent[&last];
                path.push(last);
            }
            path.reverse();
            if best.as_ref().map_or(true, |b| path.len() < b.len()) {
                best = Some(path);
            }
        }
    }
    best
}

fn rotate_to_min(mut cycle: Vec<ModuleIdentity>) -> Vec<ModuleIdentity> {
    if let Some(pos) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
    {
        cycle.rotate_left(pos);
    }
    cycle
}

/// Tarjan 强连通分量
struct Tarjan<'a> {
    adjacency: &'a [Vec<usize>],
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    next_index: usize,
    components: Vec<Vec<usize>>,
}

impl<'a> Tarjan<'a> {
    fn run(adjacency: &'a [Vec<usize>]) -> Vec<Vec<usize>> {
        let n = adjacency.len();
        let mut tarjan = Tarjan {
            adjacency,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next_index: 0,
            components: Vec::new(),
        };
        for v in 0..n {
            if tarjan.index[v].is_none() {
                tarjan.connect(v);
            }
        }
        tarjan.components
    }

    fn connect(&mut self, v: usize) {
        self.index[v] = Some(self.next_index);
        self.lowlink[v] = self.next_index;
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        let adjacency = self.adjacency;
        for &w in &adjacency[v] {
            match self.index[w] {
                None => {
                    self.connect(w);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(w_index) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(w_index);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[v]) == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            component.sort_unstable();
            self.components.push(component);
        }
    }
}
