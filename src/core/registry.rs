//! WF-005: Aspect registry — run-scoped, frozen aspect class metadata.
//!
//! Classes are registered through [`RegistryBuilder`], validated once, and
//! frozen into an [`AspectRegistry`] that is passed explicitly to every later
//! phase. Ordering relationships are stored as concrete layer-to-layer edges,
//! with relationships of a base class copied onto each derived class.

use super::diagnostics::{Diagnostic, DiagnosticCode, DiagnosticSink};
use super::eligibility::{EligibilityBuilder, EligibilityRules};
use super::error::WeaveError;
use crate::aspects::Aspect;
use crate::invoke::{InvokeSite, Invoker};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Reserved name addressing the implicit first layer of a class.
pub const PRIMARY_LAYER: &str = "primary";

/// Index of a class in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// (aspect class, optional layer name) — the unit of ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AspectLayer {
    pub aspect: String,
    /// `None` is the primary layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
}

impl AspectLayer {
    pub fn new(aspect: &str, layer: Option<&str>) -> Self {
        Self {
            aspect: aspect.to_string(),
            layer: layer.map(str::to_string),
        }
    }

    pub fn primary(aspect: &str) -> Self {
        Self::new(aspect, None)
    }

    pub fn is_primary(&self) -> bool {
        self.layer.is_none()
    }
}

impl fmt::Display for AspectLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.layer {
            Some(ref l) => write!(f, "{}:{}", self.aspect, l),
            None => f.write_str(&self.aspect),
        }
    }
}

/// An aspect layer placed in the global total order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderedAspectLayer {
    #[serde(flatten)]
    pub layer: AspectLayer,
    pub order: u32,
}

impl OrderedAspectLayer {
    pub fn aspect(&self) -> &str {
        &self.layer.aspect
    }

    pub fn layer_name(&self) -> Option<&str> {
        self.layer.layer.as_deref()
    }
}

impl PartialOrd for OrderedAspectLayer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedAspectLayer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order
            .cmp(&other.order)
            .then_with(|| self.layer.cmp(&other.layer))
    }
}

impl fmt::Display for OrderedAspectLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.layer, self.order)
    }
}

/// Which layers of a class an ordering relationship names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LayerPick {
    All,
    Primary,
    Named(String),
}

/// `Aspect`, `Aspect:primary`, or `Aspect:layer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayerSelector {
    pub aspect: String,
    pub pick: LayerPick,
}

impl LayerSelector {
    pub fn parse(s: &str) -> Result<Self, String> {
        let (aspect, pick) = match s.split_once(':') {
            None => (s, LayerPick::All),
            Some((a, PRIMARY_LAYER)) => (a, LayerPick::Primary),
            Some((a, l)) if !l.is_empty() => (a, LayerPick::Named(l.to_string())),
            Some(_) => return Err(format!("empty layer name in selector '{}'", s)),
        };
        if aspect.is_empty() {
            return Err(format!("empty aspect name in selector '{}'", s));
        }
        Ok(Self {
            aspect: aspect.to_string(),
            pick,
        })
    }

    fn with_aspect(&self, aspect: &str) -> Self {
        Self {
            aspect: aspect.to_string(),
            pick: self.pick.clone(),
        }
    }
}

impl fmt::Display for LayerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pick {
            LayerPick::All => f.write_str(&self.aspect),
            LayerPick::Primary => write!(f, "{}:{}", self.aspect, PRIMARY_LAYER),
            LayerPick::Named(ref l) => write!(f, "{}:{}", self.aspect, l),
        }
    }
}

/// Author-declared "`before` runs strictly before `after`".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderEdge {
    pub before: LayerSelector,
    pub after: LayerSelector,
}

/// Frozen per-run metadata of one aspect class.
pub struct AspectClass {
    pub id: ClassId,
    pub name: String,
    /// Layers in declaration order; the primary layer (`None`) is first.
    pub layers: Vec<Option<String>>,
    pub inheritable: bool,
    pub base: Option<ClassId>,
    pub eligibility: EligibilityRules,
    /// Set when building eligibility failed; no instance of the class runs.
    pub disabled: Option<String>,
    pub aspect: Arc<dyn Aspect>,
}

impl AspectClass {
    pub fn aspect_layers(&self) -> Vec<AspectLayer> {
        self.layers
            .iter()
            .map(|l| AspectLayer::new(&self.name, l.as_deref()))
            .collect()
    }

    pub fn has_layer(&self, layer: Option<&str>) -> bool {
        self.layers.iter().any(|l| l.as_deref() == layer)
    }

    fn select(&self, pick: &LayerPick) -> Vec<AspectLayer> {
        match pick {
            LayerPick::All => self.aspect_layers(),
            LayerPick::Primary => vec![AspectLayer::primary(&self.name)],
            LayerPick::Named(n) if self.has_layer(Some(n.as_str())) => {
                vec![AspectLayer::new(&self.name, Some(n.as_str()))]
            }
            LayerPick::Named(_) => Vec::new(),
        }
    }
}

impl fmt::Debug for AspectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AspectClass")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("layers", &self.layers)
            .field("inheritable", &self.inheritable)
            .field("base", &self.base)
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

/// Declaration of one class before registration.
pub struct AspectClassBuilder {
    name: String,
    layers: Vec<String>,
    inheritable: bool,
    base: Option<String>,
    aspect: Arc<dyn Aspect>,
}

impl AspectClassBuilder {
    pub fn new(name: &str, aspect: impl Aspect + 'static) -> Self {
        Self::from_arc(name, Arc::new(aspect))
    }

    pub fn from_arc(name: &str, aspect: Arc<dyn Aspect>) -> Self {
        Self {
            name: name.to_string(),
            layers: Vec::new(),
            inheritable: false,
            base: None,
            aspect,
        }
    }

    /// Append a named layer after the primary one.
    pub fn layer(mut self, name: &str) -> Self {
        self.layers.push(name.to_string());
        self
    }

    pub fn inheritable(mut self, yes: bool) -> Self {
        self.inheritable = yes;
        self
    }

    pub fn extends(mut self, base: &str) -> Self {
        self.base = Some(base.to_string());
        self
    }
}

/// Collects classes and ordering relationships, then freezes them.
#[derive(Default)]
pub struct RegistryBuilder {
    classes: Vec<AspectClassBuilder>,
    edges: Vec<OrderEdge>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: AspectClassBuilder) -> &mut Self {
        self.classes.push(class);
        self
    }

    pub fn edge(&mut self, before: LayerSelector, after: LayerSelector) -> &mut Self {
        self.edges.push(OrderEdge { before, after });
        self
    }

    /// `before` runs strictly before `after`; both are selector strings.
    pub fn run_before(&mut self, before: &str, after: &str) -> Result<&mut Self, WeaveError> {
        let before = LayerSelector::parse(before).map_err(WeaveError::Parse)?;
        let after = LayerSelector::parse(after).map_err(WeaveError::Parse)?;
        Ok(self.edge(before, after))
    }

    pub fn run_after(&mut self, after: &str, before: &str) -> Result<&mut Self, WeaveError> {
        self.run_before(before, after)
    }

    /// Each selector runs before the next one.
    pub fn order_chain(&mut self, chain: &[&str]) -> Result<&mut Self, WeaveError> {
        for pair in chain.windows(2) {
            self.run_before(pair[0], pair[1])?;
        }
        Ok(self)
    }

    /// Validate, build each class's eligibility once, and freeze.
    pub fn build<I: Invoker>(
        self,
        invoker: &I,
        sink: &dyn DiagnosticSink,
    ) -> Result<AspectRegistry, WeaveError> {
        let errors = self.validate();
        if !errors.is_empty() {
            return Err(WeaveError::Validation(errors));
        }

        let ids: FxHashMap<String, ClassId> = self
            .classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), ClassId(i as u32)))
            .collect();

        let mut classes = Vec::with_capacity(self.classes.len());
        for (i, decl) in self.classes.into_iter().enumerate() {
            let site = InvokeSite::new(&decl.name, "build_eligibility");
            let aspect = Arc::clone(&decl.aspect);
            let built = invoker.invoke(&site, || {
                let mut builder = EligibilityBuilder::new();
                aspect.build_eligibility(&mut builder);
                builder.build()
            });
            let (eligibility, disabled) = match built {
                Ok(rules) => (rules, None),
                Err(e) => {
                    sink.report(
                        Diagnostic::error(DiagnosticCode::AspectFailed, e.to_string())
                            .with_aspect(&decl.name),
                    );
                    (EligibilityRules::default(), Some(e.to_string()))
                }
            };
            let mut layers = vec![None];
            layers.extend(decl.layers.into_iter().map(Some));
            classes.push(AspectClass {
                id: ClassId(i as u32),
                base: decl.base.as_ref().and_then(|b| ids.get(b).copied()),
                name: decl.name,
                layers,
                inheritable: decl.inheritable,
                eligibility,
                disabled,
                aspect: decl.aspect,
            });
        }

        let layer_edges = expand_edges(&classes, &ids, &self.edges);
        tracing::debug!(
            classes = classes.len(),
            edges = layer_edges.len(),
            "aspect registry frozen"
        );
        Ok(AspectRegistry {
            classes,
            by_name: ids,
            layer_edges,
        })
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen: FxHashMap<&str, &AspectClassBuilder> = FxHashMap::default();

        for class in &self.classes {
            if class.name.is_empty() || class.name.contains(':') {
                errors.push(format!("invalid aspect class name '{}'", class.name));
            }
            if seen.insert(class.name.as_str(), class).is_some() {
                errors.push(format!("aspect class '{}' registered twice", class.name));
            }
            let mut layer_names = FxHashSet::default();
            for layer in &class.layers {
                if layer == PRIMARY_LAYER {
                    errors.push(format!(
                        "aspect '{}': layer name '{}' is reserved",
                        class.name, PRIMARY_LAYER
                    ));
                } else if !layer_names.insert(layer.as_str()) {
                    errors.push(format!(
                        "aspect '{}': layer '{}' declared twice",
                        class.name, layer
                    ));
                }
            }
        }

        for class in &self.classes {
            if let Some(ref base) = class.base {
                if !seen.contains_key(base.as_str()) {
                    errors.push(format!(
                        "aspect '{}' extends unknown aspect '{}'",
                        class.name, base
                    ));
                }
            }
            // Walk the base chain; revisiting a class means a cycle.
            let mut visited = FxHashSet::default();
            let mut cursor = Some(class);
            while let Some(c) = cursor {
                if !visited.insert(c.name.as_str()) {
                    errors.push(format!(
                        "aspect '{}' has a cyclic base chain",
                        class.name
                    ));
                    break;
                }
                cursor = c.base.as_deref().and_then(|b| seen.get(b).copied());
            }
        }

        for edge in &self.edges {
            for sel in [&edge.before, &edge.after] {
                match seen.get(sel.aspect.as_str()) {
                    None => errors.push(format!(
                        "ordering relationship names unknown aspect '{}'",
                        sel.aspect
                    )),
                    Some(c) => {
                        if let LayerPick::Named(ref l) = sel.pick {
                            if !c.layers.contains(l) {
                                errors.push(format!(
                                    "ordering relationship names unknown layer '{}'",
                                    sel
                                ));
                            }
                        }
                    }
                }
            }
            if edge.before == edge.after {
                errors.push(format!("aspect layer '{}' ordered before itself", edge.before));
            }
        }

        errors
    }
}

/// Resolve selectors to concrete layer edges, then copy every relationship a
/// base class takes part in onto each class derived from it.
fn expand_edges(
    classes: &[AspectClass],
    ids: &FxHashMap<String, ClassId>,
    edges: &[OrderEdge],
) -> Vec<(AspectLayer, AspectLayer)> {
    let mut declared: Vec<OrderEdge> = edges.to_vec();
    for class in classes {
        let mut ancestor = class.base;
        let mut guard = 0;
        while let Some(base_id) = ancestor {
            let base = &classes[base_id.0 as usize];
            for edge in edges {
                let before = (edge.before.aspect == base.name)
                    .then(|| edge.before.with_aspect(&class.name));
                let after = (edge.after.aspect == base.name)
                    .then(|| edge.after.with_aspect(&class.name));
                if before.is_none() && after.is_none() {
                    continue;
                }
                let inherited = OrderEdge {
                    before: before.unwrap_or_else(|| edge.before.clone()),
                    after: after.unwrap_or_else(|| edge.after.clone()),
                };
                if inherited.before.aspect != inherited.after.aspect {
                    declared.push(inherited);
                }
            }
            ancestor = base.base;
            guard += 1;
            if guard > classes.len() {
                break;
            }
        }
    }

    let mut out = Vec::new();
    let mut seen = FxHashSet::default();
    for edge in &declared {
        let (Some(b), Some(a)) = (ids.get(&edge.before.aspect), ids.get(&edge.after.aspect))
        else {
            continue;
        };
        let befores = classes[b.0 as usize].select(&edge.before.pick);
        let afters = classes[a.0 as usize].select(&edge.after.pick);
        for before in &befores {
            for after in &afters {
                if before != after && seen.insert((before.clone(), after.clone())) {
                    out.push((before.clone(), after.clone()));
                }
            }
        }
    }
    out
}

/// Frozen, run-scoped registry.
#[derive(Debug)]
pub struct AspectRegistry {
    classes: Vec<AspectClass>,
    by_name: FxHashMap<String, ClassId>,
    layer_edges: Vec<(AspectLayer, AspectLayer)>,
}

impl AspectRegistry {
    pub fn get(&self, id: ClassId) -> &AspectClass {
        &self.classes[id.0 as usize]
    }

    pub fn by_name(&self, name: &str) -> Option<&AspectClass> {
        self.by_name.get(name).map(|id| self.get(*id))
    }

    pub fn id_of(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    /// Classes in registration order.
    pub fn classes(&self) -> &[AspectClass] {
        &self.classes
    }

    /// Concrete "strictly before" edges between layers.
    pub fn layer_edges(&self) -> &[(AspectLayer, AspectLayer)] {
        &self.layer_edges
    }

    /// Every layer of every class, registration order then layer order.
    pub fn all_layers(&self) -> Vec<AspectLayer> {
        self.classes.iter().flat_map(|c| c.aspect_layers()).collect()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
