//! Model specification, parameter state and the layout of free parameters.
//!
//! A `Model` owns one copy of every item per group plus the group's latent mean and
//! covariance parameters. Equality constraints are resolved once into a
//! `ParameterLayout`: every free parameter slot maps to a canonical index, and slots
//! joined by constraints share one canonical value. Owners (items or latent blocks)
//! connected through shared canonical indices form the M-step blocks.

use std::collections::HashMap;

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::config::PriorDensity;
use crate::data::ResponseMatrix;
use crate::error::{MirtError, MirtResult};
use crate::items::{Item, ItemType, Param, Prior};
use crate::linalg::{self, MvnDensity};
use crate::quadrature::QuadratureGrid;
use crate::start;
use crate::utils::num_gradient;

/// Reference to a parameter in a `ModelSpec`. `group: None` applies to every group;
/// `item: None` addresses the latent parameters (`MEAN_k`, `COV_kl`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParRef {
    pub group: Option<usize>,
    pub item: Option<usize>,
    pub name: String,
}

impl ParRef {
    pub fn item(item: usize, name: &str) -> Self {
        ParRef {
            group: None,
            item: Some(item),
            name: name.to_string(),
        }
    }

    pub fn latent(name: &str) -> Self {
        ParRef {
            group: None,
            item: None,
            name: name.to_string(),
        }
    }

    pub fn in_group(mut self, group: usize) -> Self {
        self.group = Some(group);
        self
    }
}

/// Cross-group equality and freeing rules for multiple-group models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invariance {
    pub slopes: bool,
    /// Every non-slope item parameter
    pub intercepts: bool,
    pub free_means: bool,
    pub free_var: bool,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub nfact: usize,
    /// One type per item, or a single type for every item
    pub itemtypes: Vec<ItemType>,
    /// J×D loading pattern; `None` is an exploratory model
    pub loadings: Option<Array2<bool>>,
    pub item_names: Option<Vec<String>>,
    /// Scoring keys in original category codes (nested logit items)
    pub keys: Option<Vec<Option<i32>>>,
    pub constraints: Vec<Vec<ParRef>>,
    pub fixed: Vec<(ParRef, f64)>,
    pub free: Vec<ParRef>,
    pub starts: Vec<(ParRef, f64)>,
    pub priors: Vec<(ParRef, Prior)>,
    pub bounds: Vec<(ParRef, f64, f64)>,
    pub invariance: Invariance,
}

impl ModelSpec {
    pub fn exploratory(nfact: usize, itemtype: ItemType) -> Self {
        ModelSpec {
            nfact,
            itemtypes: vec![itemtype],
            loadings: None,
            item_names: None,
            keys: None,
            constraints: Vec::new(),
            fixed: Vec::new(),
            free: Vec::new(),
            starts: Vec::new(),
            priors: Vec::new(),
            bounds: Vec::new(),
            invariance: Invariance::default(),
        }
    }

    pub fn confirmatory(loadings: Array2<bool>, itemtype: ItemType) -> Self {
        ModelSpec {
            nfact: loadings.ncols(),
            loadings: Some(loadings),
            ..ModelSpec::exploratory(1, itemtype)
        }
    }

    pub fn with_itemtypes(mut self, itemtypes: Vec<ItemType>) -> Self {
        self.itemtypes = itemtypes;
        self
    }

    pub fn with_item_names(mut self, names: Vec<String>) -> Self {
        self.item_names = Some(names);
        self
    }

    pub fn with_keys(mut self, keys: Vec<Option<i32>>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn constrain(mut self, pars: Vec<ParRef>) -> Self {
        self.constraints.push(pars);
        self
    }

    pub fn fix(mut self, par: ParRef, value: f64) -> Self {
        self.fixed.push((par, value));
        self
    }

    pub fn free_par(mut self, par: ParRef) -> Self {
        self.free.push(par);
        self
    }

    pub fn start(mut self, par: ParRef, value: f64) -> Self {
        self.starts.push((par, value));
        self
    }

    pub fn prior(mut self, par: ParRef, prior: Prior) -> Self {
        self.priors.push((par, prior));
        self
    }

    pub fn bound(mut self, par: ParRef, lower: f64, upper: f64) -> Self {
        self.bounds.push((par, lower, upper));
        self
    }

    pub fn with_invariance(mut self, invariance: Invariance) -> Self {
        self.invariance = invariance;
        self
    }
}

/// Latent mean vector and lower-triangular covariance of one group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPars {
    pub nfact: usize,
    /// `MEAN_1..MEAN_D` followed by `COV_kl` (k >= l) row by row
    pub pars: Vec<Param>,
}

impl GroupPars {
    pub fn standard(nfact: usize) -> Self {
        let mut pars: Vec<Param> = (1..=nfact)
            .map(|k| Param::new(format!("MEAN_{}", k), 0.0, false))
            .collect();
        for k in 0..nfact {
            for l in 0..=k {
                let v = if k == l { 1.0 } else { 0.0 };
                pars.push(Param::new(format!("COV_{}{}", k + 1, l + 1), v, false));
            }
        }
        GroupPars { nfact, pars }
    }

    pub fn cov_index(&self, k: usize, l: usize) -> usize {
        let (k, l) = if k >= l { (k, l) } else { (l, k) };
        self.nfact + k * (k + 1) / 2 + l
    }

    pub fn mean_cov_with(&self, values: &[f64]) -> (Array1<f64>, Array2<f64>) {
        let d = self.nfact;
        let mean: Array1<f64> = values[..d].iter().copied().collect();
        let mut cov = Array2::zeros((d, d));
        for k in 0..d {
            for l in 0..=k {
                let v = values[self.cov_index(k, l)];
                cov[[k, l]] = v;
                cov[[l, k]] = v;
            }
        }
        (mean, cov)
    }

    pub fn values(&self) -> Vec<f64> {
        self.pars.iter().map(|p| p.value).collect()
    }

    pub fn mean(&self) -> Array1<f64> {
        self.mean_cov_with(&self.values()).0
    }

    pub fn cov(&self) -> Array2<f64> {
        self.mean_cov_with(&self.values()).1
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.pars.iter().position(|p| p.name == name)
    }

    /// Overwrite mean and covariance from arrays.
    pub fn set_mean_cov(&mut self, mean: &Array1<f64>, cov: &Array2<f64>) {
        for k in 0..self.nfact {
            self.pars[k].value = mean[k];
            for l in 0..=k {
                let idx = self.cov_index(k, l);
                self.pars[idx].value = cov[[k, l]];
            }
        }
    }
}

/// Log-density of a group's latent distribution at arbitrary trait values.
#[derive(Debug, Clone)]
pub enum LatentPrior {
    Normal(MvnDensity),
    Custom(PriorDensity),
}

impl LatentPrior {
    pub fn log_density(&self, theta: ArrayView1<f64>) -> f64 {
        match self {
            LatentPrior::Normal(mvn) => mvn.log_pdf(theta),
            LatentPrior::Custom(density) => density.eval(&theta.to_vec()).ln(),
        }
    }

    pub fn grad_log_density(&self, theta: ArrayView1<f64>) -> Array1<f64> {
        match self {
            LatentPrior::Normal(mvn) => mvn.grad_log_pdf(theta),
            LatentPrior::Custom(_) => {
                num_gradient(|t| self.log_density(t.view()), &theta.to_owned())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupModel {
    pub items: Vec<Item>,
    pub latent: GroupPars,
    /// Empirical histogram weights on the estimation grid, when estimated
    pub histogram: Option<Array1<f64>>,
}

/// Owner of a parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Owner {
    Item { group: usize, item: usize },
    Latent { group: usize },
}

impl Owner {
    pub fn group(&self) -> usize {
        match *self {
            Owner::Item { group, .. } | Owner::Latent { group } => group,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub owner: Owner,
    pub par: usize,
}

/// Set of owners optimised jointly, with the canonical parameters they touch.
#[derive(Debug, Clone)]
pub struct Block {
    pub owners: Vec<Owner>,
    pub canon: Vec<usize>,
}

impl Block {
    pub fn is_latent(&self) -> bool {
        self.owners.iter().all(|o| matches!(o, Owner::Latent { .. }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterLayout {
    pub slots: Vec<Slot>,
    pub canon_of_slot: Vec<usize>,
    pub canon_slots: Vec<Vec<usize>>,
    pub blocks: Vec<Block>,
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        // keep the earlier slot as root so canonical order follows slot order
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent[hi] = lo;
    }
}

impl ParameterLayout {
    fn build(groups: &[GroupModel], equalities: &[Vec<Slot>]) -> MirtResult<Self> {
        let mut slots = Vec::new();
        for (g, gm) in groups.iter().enumerate() {
            for (j, item) in gm.items.iter().enumerate() {
                for (p, par) in item.pars.iter().enumerate() {
                    if par.free {
                        slots.push(Slot {
                            owner: Owner::Item { group: g, item: j },
                            par: p,
                        });
                    }
                }
            }
            for (p, par) in gm.latent.pars.iter().enumerate() {
                if par.free {
                    slots.push(Slot {
                        owner: Owner::Latent { group: g },
                        par: p,
                    });
                }
            }
        }
        let index: HashMap<Slot, usize> = slots.iter().enumerate().map(|(i, s)| (*s, i)).collect();

        let mut parent: Vec<usize> = (0..slots.len()).collect();
        for set in equalities {
            let mut ids = Vec::with_capacity(set.len());
            for s in set {
                match index.get(s) {
                    Some(&i) => ids.push(i),
                    None => {
                        return Err(MirtError::Input(
                            "equality constraint refers to a parameter that is not free".into(),
                        ))
                    }
                }
            }
            for w in ids.windows(2) {
                union(&mut parent, w[0], w[1]);
            }
        }

        let mut canon_of_root: HashMap<usize, usize> = HashMap::new();
        let mut canon_of_slot = Vec::with_capacity(slots.len());
        let mut canon_slots: Vec<Vec<usize>> = Vec::new();
        for i in 0..slots.len() {
            let root = find(&mut parent, i);
            let next = canon_slots.len();
            let c = *canon_of_root.entry(root).or_insert(next);
            if c == next {
                canon_slots.push(Vec::new());
            }
            canon_slots[c].push(i);
            canon_of_slot.push(c);
        }

        // owners joined by shared canonical parameters
        let mut owners: Vec<Owner> = slots.iter().map(|s| s.owner).collect();
        owners.dedup();
        let owner_index: HashMap<Owner, usize> =
            owners.iter().enumerate().map(|(i, o)| (*o, i)).collect();
        let mut oparent: Vec<usize> = (0..owners.len()).collect();
        for members in &canon_slots {
            for w in members.windows(2) {
                let a = owner_index[&slots[w[0]].owner];
                let b = owner_index[&slots[w[1]].owner];
                union(&mut oparent, a, b);
            }
        }
        let mut block_of_root: HashMap<usize, usize> = HashMap::new();
        let mut blocks: Vec<Block> = Vec::new();
        for (i, o) in owners.iter().enumerate() {
            let root = find(&mut oparent, i);
            let next = blocks.len();
            let b = *block_of_root.entry(root).or_insert(next);
            if b == next {
                blocks.push(Block {
                    owners: Vec::new(),
                    canon: Vec::new(),
                });
            }
            blocks[b].owners.push(*o);
        }
        for (c, members) in canon_slots.iter().enumerate() {
            let o = owner_index[&slots[members[0]].owner];
            let root = find(&mut oparent, o);
            blocks[block_of_root[&root]].canon.push(c);
        }

        Ok(ParameterLayout {
            slots,
            canon_of_slot,
            canon_slots,
            blocks,
        })
    }

    pub fn n_canonical(&self) -> usize {
        self.canon_slots.len()
    }
}

/// One row of the editable parameter table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParRow {
    pub group: usize,
    /// `None` for latent parameters
    pub item: Option<usize>,
    pub item_name: String,
    pub class: String,
    pub name: String,
    pub value: f64,
    pub free: bool,
    pub lbound: Option<f64>,
    pub ubound: Option<f64>,
    /// Canonical index shared by constrained parameters
    pub constraint: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParameterTable {
    pub rows: Vec<ParRow>,
}

impl ParameterTable {
    fn position(&self, group: usize, item: Option<usize>, name: &str) -> Option<usize> {
        self.rows
            .iter()
            .position(|r| r.group == group && r.item == item && r.name == name)
    }

    pub fn get(&self, group: usize, item: Option<usize>, name: &str) -> Option<&ParRow> {
        self.position(group, item, name).map(|i| &self.rows[i])
    }

    /// Edit a value; constrained partners are updated too so the table stays consistent.
    pub fn set_value(
        &mut self,
        group: usize,
        item: Option<usize>,
        name: &str,
        value: f64,
    ) -> MirtResult<()> {
        let i = self.position(group, item, name).ok_or_else(|| {
            MirtError::Input(format!("no parameter {} for group {} item {:?}", name, group, item))
        })?;
        match self.rows[i].constraint {
            Some(c) => {
                for row in self.rows.iter_mut().filter(|r| r.constraint == Some(c)) {
                    row.value = value;
                }
            }
            None => self.rows[i].value = value,
        }
        Ok(())
    }
}

fn finite(x: f64) -> Option<f64> {
    if x.is_finite() {
        Some(x)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    pub nfact: usize,
    pub groups: Vec<GroupModel>,
    pub item_names: Vec<String>,
    /// Observed category codes per item, for recoding scoring patterns
    pub categories: Vec<Vec<i32>>,
    pub custom_prior: Option<PriorDensity>,
    equalities: Vec<Vec<Slot>>,
    layout: ParameterLayout,
}

impl Model {
    /// Resolve a specification against the data: items, start values, constraints.
    pub fn build(data: &ResponseMatrix, spec: &ModelSpec) -> MirtResult<Self> {
        let nfact = spec.nfact;
        let n_items = data.n_items();
        let n_groups = data.n_groups();
        if nfact == 0 {
            return Err(MirtError::Input("a model needs at least one factor".into()));
        }
        let itemtypes: Vec<ItemType> = match spec.itemtypes.len() {
            1 => vec![spec.itemtypes[0].clone(); n_items],
            n if n == n_items => spec.itemtypes.clone(),
            n => {
                return Err(MirtError::Input(format!(
                    "{} item types given for {} items",
                    n, n_items
                )))
            }
        };
        let loadings = match &spec.loadings {
            Some(l) if l.dim() == (n_items, nfact) => l.clone(),
            Some(l) => {
                return Err(MirtError::Input(format!(
                    "loading pattern is {:?}, expected ({}, {})",
                    l.dim(),
                    n_items,
                    nfact
                )))
            }
            // exploratory: item j does not load on factors beyond j for the first D-1 items
            None => Array2::from_shape_fn((n_items, nfact), |(j, k)| k <= j),
        };
        let item_names = match &spec.item_names {
            Some(names) if names.len() == n_items => names.clone(),
            Some(names) => {
                return Err(MirtError::Input(format!(
                    "{} item names given for {} items",
                    names.len(),
                    n_items
                )))
            }
            None => (1..=n_items).map(|j| format!("Item_{}", j)).collect(),
        };
        let ncats = data.n_categories();
        let categories = data.category_values().to_vec();

        let mut keys: Vec<Option<usize>> = vec![None; n_items];
        if let Some(raw_keys) = &spec.keys {
            if raw_keys.len() != n_items {
                return Err(MirtError::Input("one key per item is required".into()));
            }
            for (j, key) in raw_keys.iter().enumerate() {
                if let Some(code) = key {
                    let k = categories[j].binary_search(code).map_err(|_| {
                        MirtError::Input(format!("key {} was not observed for item {}", code, j))
                    })?;
                    keys[j] = Some(k);
                }
            }
        }

        let mut base_items = Vec::with_capacity(n_items);
        for j in 0..n_items {
            base_items.push(Item::new(
                item_names[j].clone(),
                itemtypes[j].clone(),
                ncats[j],
                nfact,
                loadings.row(j).to_vec(),
                keys[j],
            )?);
        }
        start::apply_start_values(&mut base_items, data.data());

        let slopes_fixed = base_items
            .iter()
            .all(|it| it.slope_indices().iter().all(|&p| !it.pars[p].free));

        let mut groups: Vec<GroupModel> = (0..n_groups)
            .map(|g| {
                let mut latent = GroupPars::standard(nfact);
                for k in 0..nfact {
                    let var = latent.cov_index(k, k);
                    if slopes_fixed {
                        latent.pars[var].free = true;
                    }
                    if g > 0 && spec.invariance.free_var {
                        latent.pars[var].free = true;
                    }
                    if g > 0 && spec.invariance.free_means {
                        latent.pars[k].free = true;
                    }
                }
                GroupModel {
                    items: base_items.clone(),
                    latent,
                    histogram: None,
                }
            })
            .collect();

        let mut equalities: Vec<Vec<Slot>> = Vec::new();
        rating_scale_constraints(&mut groups, &mut equalities);

        let mut model = Model {
            nfact,
            groups,
            item_names,
            categories,
            custom_prior: None,
            equalities: Vec::new(),
            layout: ParameterLayout::default(),
        };

        for (r, v) in &spec.fixed {
            for (owner, p) in model.resolve(r)? {
                let par = model.param_mut(owner, p);
                par.value = *v;
                par.free = false;
            }
        }
        for r in &spec.free {
            for (owner, p) in model.resolve(r)? {
                model.param_mut(owner, p).free = true;
            }
        }
        for (r, v) in &spec.starts {
            for (owner, p) in model.resolve(r)? {
                model.param_mut(owner, p).value = *v;
            }
        }
        for (r, prior) in &spec.priors {
            for (owner, p) in model.resolve(r)? {
                model.param_mut(owner, p).prior = *prior;
            }
        }
        for (r, lo, hi) in &spec.bounds {
            if !(lo < hi) {
                return Err(MirtError::Input(format!("bounds for {} are not increasing", r.name)));
            }
            for (owner, p) in model.resolve(r)? {
                let par = model.param_mut(owner, p);
                par.lbound = *lo;
                par.ubound = *hi;
                par.value = par.value.clamp(*lo, *hi);
            }
        }

        if n_groups > 1 && (spec.invariance.slopes || spec.invariance.intercepts) {
            for j in 0..n_items {
                let item = &model.groups[0].items[j];
                let slopes = item.slope_indices();
                for p in 0..item.npars() {
                    let is_slope = slopes.contains(&p);
                    let wanted = (is_slope && spec.invariance.slopes)
                        || (!is_slope && spec.invariance.intercepts);
                    if wanted && model.groups.iter().all(|gm| gm.items[j].pars[p].free) {
                        equalities.push(
                            (0..n_groups)
                                .map(|g| Slot {
                                    owner: Owner::Item { group: g, item: j },
                                    par: p,
                                })
                                .collect(),
                        );
                    }
                }
            }
        }

        for set in &spec.constraints {
            let mut per_group: Vec<Vec<Slot>> = vec![Vec::new(); n_groups];
            let mut explicit: Vec<Slot> = Vec::new();
            for r in set {
                for (owner, p) in model.resolve(r)? {
                    let slot = Slot { owner, par: p };
                    match r.group {
                        Some(_) => explicit.push(slot),
                        None => per_group[owner.group()].push(slot),
                    }
                }
            }
            if !explicit.is_empty() {
                let latent_groups: Vec<usize> = explicit
                    .iter()
                    .filter(|s| matches!(s.owner, Owner::Latent { .. }))
                    .map(|s| s.owner.group())
                    .collect();
                if latent_groups.windows(2).any(|w| w[0] != w[1]) {
                    return Err(MirtError::Input(
                        "equality constraints on latent parameters across groups are not supported".into(),
                    ));
                }
                equalities.push(explicit);
            }
            equalities.extend(per_group.into_iter().filter(|s| s.len() > 1));
        }
        for set in &equalities {
            let latent = set.iter().filter(|s| matches!(s.owner, Owner::Latent { .. })).count();
            if latent > 0 && latent < set.len() {
                return Err(MirtError::Input(
                    "item and latent parameters cannot be constrained equal".into(),
                ));
            }
        }

        for (g, gm) in model.groups.iter().enumerate() {
            if !linalg::is_positive_definite(&gm.latent.cov()) {
                return Err(MirtError::Input(format!(
                    "latent covariance of group {} is not positive definite",
                    g
                )));
            }
        }

        model.equalities = equalities;
        model.rebuild_layout()?;
        // constrained slots start from a common value
        let raw = model.raw();
        model.set_raw(&raw);
        Ok(model)
    }

    fn resolve(&self, r: &ParRef) -> MirtResult<Vec<(Owner, usize)>> {
        let groups: Vec<usize> = match r.group {
            Some(g) if g < self.groups.len() => vec![g],
            Some(g) => return Err(MirtError::Input(format!("group {} does not exist", g))),
            None => (0..self.groups.len()).collect(),
        };
        let mut out = Vec::with_capacity(groups.len());
        for g in groups {
            match r.item {
                Some(j) => {
                    let item = self.groups[g]
                        .items
                        .get(j)
                        .ok_or_else(|| MirtError::Input(format!("item {} does not exist", j)))?;
                    let p = item.param_index(&r.name).ok_or_else(|| {
                        MirtError::Input(format!("item {} has no parameter {}", item.name, r.name))
                    })?;
                    out.push((Owner::Item { group: g, item: j }, p));
                }
                None => {
                    let p = self.groups[g]
                        .latent
                        .param_index(&r.name)
                        .ok_or_else(|| {
                            MirtError::Input(format!("no latent parameter {}", r.name))
                        })?;
                    out.push((Owner::Latent { group: g }, p));
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn rebuild_layout(&mut self) -> MirtResult<()> {
        self.layout = ParameterLayout::build(&self.groups, &self.equalities)?;
        Ok(())
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn n_items(&self) -> usize {
        self.item_names.len()
    }

    pub fn param(&self, owner: Owner, p: usize) -> &Param {
        match owner {
            Owner::Item { group, item } => &self.groups[group].items[item].pars[p],
            Owner::Latent { group } => &self.groups[group].latent.pars[p],
        }
    }

    pub fn param_mut(&mut self, owner: Owner, p: usize) -> &mut Param {
        match owner {
            Owner::Item { group, item } => &mut self.groups[group].items[item].pars[p],
            Owner::Latent { group } => &mut self.groups[group].latent.pars[p],
        }
    }

    /// Number of canonical free parameters.
    pub fn npars(&self) -> usize {
        self.layout.n_canonical()
    }

    fn canon_param(&self, c: usize) -> &Param {
        let slot = self.layout.slots[self.layout.canon_slots[c][0]];
        self.param(slot.owner, slot.par)
    }

    /// Canonical free parameters on the raw scale.
    pub fn raw(&self) -> Array1<f64> {
        (0..self.npars()).map(|c| self.canon_param(c).raw()).collect()
    }

    pub fn set_raw(&mut self, x: &Array1<f64>) {
        for c in 0..self.layout.n_canonical() {
            for k in 0..self.layout.canon_slots[c].len() {
                let slot = self.layout.slots[self.layout.canon_slots[c][k]];
                self.param_mut(slot.owner, slot.par).set_raw(x[c]);
            }
        }
    }

    pub fn raw_bounds(&self) -> Vec<(f64, f64)> {
        (0..self.npars()).map(|c| self.canon_param(c).raw_bounds()).collect()
    }

    /// Display names of the canonical parameters.
    pub fn names(&self) -> Vec<String> {
        let multi = self.groups.len() > 1;
        (0..self.npars())
            .map(|c| {
                let slot = self.layout.slots[self.layout.canon_slots[c][0]];
                let owner = match slot.owner {
                    Owner::Item { item, .. } => self.item_names[item].clone(),
                    Owner::Latent { .. } => "GROUP".to_string(),
                };
                let name = format!("{}.{}", owner, self.param(slot.owner, slot.par).name);
                if multi {
                    format!("G{}.{}", slot.owner.group() + 1, name)
                } else {
                    name
                }
            })
            .collect()
    }

    /// Sum of log-priors over canonical parameters.
    pub fn log_prior(&self) -> f64 {
        (0..self.npars())
            .map(|c| {
                let p = self.canon_param(c);
                if p.prior.is_none() {
                    0.0
                } else {
                    p.log_prior()
                }
            })
            .sum()
    }

    /// Latent prior weights of group `g` on `grid`.
    pub fn prior_weights(&self, g: usize, grid: &QuadratureGrid) -> MirtResult<Array1<f64>> {
        let gm = &self.groups[g];
        if let Some(h) = &gm.histogram {
            if h.len() == grid.n_nodes() {
                return Ok(h.clone());
            }
        }
        if let Some(density) = &self.custom_prior {
            return grid.density_weights(density);
        }
        grid.mvn_weights(&gm.latent.mean(), &gm.latent.cov())
    }

    pub fn latent_prior(&self, g: usize) -> MirtResult<LatentPrior> {
        match &self.custom_prior {
            Some(density) => Ok(LatentPrior::Custom(density.clone())),
            None => {
                let latent = &self.groups[g].latent;
                Ok(LatentPrior::Normal(MvnDensity::new(&latent.mean(), &latent.cov())?))
            }
        }
    }

    /// Independence model: every slope fixed at zero and the latent scale fixed.
    pub fn null_model(&self) -> MirtResult<Model> {
        let mut null = self.clone();
        for gm in null.groups.iter_mut() {
            for item in gm.items.iter_mut() {
                let slopes = item.slope_indices();
                for (p, par) in item.pars.iter_mut().enumerate() {
                    if slopes.contains(&p) {
                        par.value = 0.0;
                        par.free = false;
                    } else if par.name.starts_with("ak") {
                        par.free = false;
                    }
                }
            }
            gm.latent = GroupPars::standard(self.nfact);
            gm.histogram = None;
        }
        let removed: Vec<Vec<Slot>> = null
            .equalities
            .iter()
            .map(|set| {
                set.iter()
                    .copied()
                    .filter(|s| null.param(s.owner, s.par).free)
                    .collect::<Vec<Slot>>()
            })
            .filter(|set| set.len() > 1)
            .collect();
        null.equalities = removed;
        null.rebuild_layout()?;
        Ok(null)
    }

    pub fn parameter_table(&self) -> ParameterTable {
        let mut constraint_of: HashMap<Slot, usize> = HashMap::new();
        for (c, members) in self.layout.canon_slots.iter().enumerate() {
            if members.len() > 1 {
                for &i in members {
                    constraint_of.insert(self.layout.slots[i], c);
                }
            }
        }
        let mut rows = Vec::new();
        for (g, gm) in self.groups.iter().enumerate() {
            for (j, item) in gm.items.iter().enumerate() {
                let owner = Owner::Item { group: g, item: j };
                for (p, par) in item.pars.iter().enumerate() {
                    rows.push(ParRow {
                        group: g,
                        item: Some(j),
                        item_name: item.name.clone(),
                        class: item.itemtype.tag().to_string(),
                        name: par.name.clone(),
                        value: par.value,
                        free: par.free,
                        lbound: finite(par.lbound),
                        ubound: finite(par.ubound),
                        constraint: constraint_of.get(&Slot { owner, par: p }).copied(),
                    });
                }
            }
            let owner = Owner::Latent { group: g };
            for (p, par) in gm.latent.pars.iter().enumerate() {
                rows.push(ParRow {
                    group: g,
                    item: None,
                    item_name: "GROUP".to_string(),
                    class: "GroupPars".to_string(),
                    name: par.name.clone(),
                    value: par.value,
                    free: par.free,
                    lbound: finite(par.lbound),
                    ubound: finite(par.ubound),
                    constraint: constraint_of.get(&Slot { owner, par: p }).copied(),
                });
            }
        }
        ParameterTable { rows }
    }

    /// Copy of the model with values taken from an edited parameter table.
    pub fn with_parameter_table(&self, table: &ParameterTable) -> MirtResult<Model> {
        let template = self.parameter_table();
        if template.rows.len() != table.rows.len() {
            return Err(MirtError::Input(format!(
                "parameter table has {} rows, the model has {}",
                table.rows.len(),
                template.rows.len()
            )));
        }
        let mut out = self.clone();
        let mut i = 0;
        for g in 0..out.groups.len() {
            let n_items = out.groups[g].items.len();
            for j in 0..n_items {
                for p in 0..out.groups[g].items[j].npars() {
                    let row = &table.rows[i];
                    check_row(&template.rows[i], row)?;
                    out.groups[g].items[j].pars[p].value = row.value;
                    i += 1;
                }
            }
            for p in 0..out.groups[g].latent.pars.len() {
                let row = &table.rows[i];
                check_row(&template.rows[i], row)?;
                out.groups[g].latent.pars[p].value = row.value;
                i += 1;
            }
            if !linalg::is_positive_definite(&out.groups[g].latent.cov()) {
                return Err(MirtError::Input(format!(
                    "edited latent covariance of group {} is not positive definite",
                    g
                )));
            }
        }
        for members in &out.layout.canon_slots {
            let first = out.layout.slots[members[0]];
            let v = out.param(first.owner, first.par).value;
            for &m in members.iter().skip(1) {
                let s = out.layout.slots[m];
                if out.param(s.owner, s.par).value != v {
                    return Err(MirtError::Input(format!(
                        "constrained parameter {} has unequal values",
                        out.param(s.owner, s.par).name
                    )));
                }
            }
        }
        Ok(out)
    }
}

fn check_row(expected: &ParRow, row: &ParRow) -> MirtResult<()> {
    if expected.group != row.group || expected.item != row.item || expected.name != row.name {
        return Err(MirtError::Input(format!(
            "parameter table row {}.{} does not match the model layout",
            row.item_name, row.name
        )));
    }
    if expected.free != row.free {
        return Err(MirtError::Input(format!(
            "free flag of {}.{} cannot be changed through the table",
            row.item_name, row.name
        )));
    }
    if !row.value.is_finite() {
        return Err(MirtError::Input(format!("{}.{} is not finite", row.item_name, row.name)));
    }
    Ok(())
}

/// grsm and rsm items of equal length share their intercepts; the first item's `c` is fixed.
fn rating_scale_constraints(groups: &mut [GroupModel], equalities: &mut Vec<Vec<Slot>>) {
    for (g, gm) in groups.iter_mut().enumerate() {
        let mut families: Vec<(String, usize, Vec<usize>)> = Vec::new();
        for (j, item) in gm.items.iter().enumerate() {
            if !item.itemtype.is_rating_scale() {
                continue;
            }
            let tag = item.itemtype.tag().to_string();
            match families.iter_mut().find(|(t, k, _)| *t == tag && *k == item.ncat) {
                Some(f) => f.2.push(j),
                None => families.push((tag, item.ncat, vec![j])),
            }
        }
        for (_, ncat, members) in families {
            let first = members[0];
            if let Some(c) = gm.items[first].param_index("c") {
                gm.items[first].pars[c].value = 0.0;
                gm.items[first].pars[c].free = false;
            }
            if members.len() < 2 {
                continue;
            }
            for k in 1..ncat {
                let name = format!("d{}", k);
                let set: Vec<Slot> = members
                    .iter()
                    .filter_map(|&j| {
                        gm.items[j].param_index(&name).map(|p| Slot {
                            owner: Owner::Item { group: g, item: j },
                            par: p,
                        })
                    })
                    .collect();
                if set.len() > 1 {
                    equalities.push(set);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn binary_data() -> ResponseMatrix {
        ResponseMatrix::new(array![
            [0, 0, 1, 1],
            [1, 0, 1, 0],
            [1, 1, 1, 1],
            [0, 0, 0, 1],
            [1, 1, 0, 1],
            [0, 1, 1, 0]
        ])
        .unwrap()
    }

    #[test]
    fn unconstrained_items_form_their_own_blocks() {
        let spec = ModelSpec::exploratory(1, ItemType::TwoPL);
        let model = Model::build(&binary_data(), &spec).unwrap();
        assert_eq!(model.npars(), 8);
        assert_eq!(model.layout().blocks.len(), 4);
        assert_eq!(model.names()[0], "Item_1.a1");
    }

    #[test]
    fn equality_constraints_merge_blocks() {
        let spec = ModelSpec::exploratory(1, ItemType::TwoPL)
            .constrain(vec![ParRef::item(0, "a1"), ParRef::item(2, "a1"), ParRef::item(3, "a1")]);
        let model = Model::build(&binary_data(), &spec).unwrap();
        assert_eq!(model.npars(), 6);
        assert_eq!(model.layout().blocks.len(), 2);
        let raw = model.raw();
        let a0 = model.groups[0].items[0].pars[0].value;
        let a3 = model.groups[0].items[3].pars[0].value;
        assert_eq!(a0, a3);
        assert_eq!(raw.len(), 6);
    }

    #[test]
    fn rasch_frees_the_latent_variance() {
        let spec = ModelSpec::exploratory(1, ItemType::Rasch);
        let model = Model::build(&binary_data(), &spec).unwrap();
        // four intercepts plus COV_11
        assert_eq!(model.npars(), 5);
        assert!(model.layout().blocks.iter().any(|b| b.is_latent()));
    }

    #[test]
    fn exploratory_two_factor_fixes_the_rotation() {
        let spec = ModelSpec::exploratory(2, ItemType::TwoPL);
        let model = Model::build(&binary_data(), &spec).unwrap();
        let first = &model.groups[0].items[0];
        assert!(!first.pars[1].free);
        assert_eq!(first.pars[1].value, 0.0);
        assert!(model.groups[0].items[1].pars[1].free);
    }

    #[test]
    fn rating_scale_items_share_intercepts() {
        let data =
            ResponseMatrix::new(array![[0, 1, 2], [1, 2, 0], [2, 2, 1], [0, 0, 1], [1, 1, 2]])
                .unwrap();
        let model = Model::build(&data, &ModelSpec::exploratory(1, ItemType::Grsm)).unwrap();
        // 3 slopes + shared d1, d2 + c for items 2 and 3
        assert_eq!(model.npars(), 7);
        assert_eq!(model.layout().blocks.len(), 1);
    }

    #[test]
    fn parameter_table_round_trip() {
        let spec = ModelSpec::exploratory(1, ItemType::TwoPL);
        let model = Model::build(&binary_data(), &spec).unwrap();
        let mut table = model.parameter_table();
        table.set_value(0, Some(1), "d", -0.75).unwrap();
        let edited = model.with_parameter_table(&table).unwrap();
        assert_eq!(edited.parameter_table(), table);
        table.set_value(0, None, "COV_11", -1.0).unwrap();
        assert!(model.with_parameter_table(&table).is_err());
    }

    #[test]
    fn null_model_drops_slopes() {
        let spec = ModelSpec::exploratory(1, ItemType::TwoPL);
        let model = Model::build(&binary_data(), &spec).unwrap();
        let null = model.null_model().unwrap();
        assert_eq!(null.npars(), 4);
        assert!(null.groups[0].items.iter().all(|it| it.pars[0].value == 0.0));
    }

    #[test]
    fn unknown_parameters_are_rejected() {
        let spec = ModelSpec::exploratory(1, ItemType::TwoPL).fix(ParRef::item(0, "c"), 0.0);
        assert!(matches!(Model::build(&binary_data(), &spec), Err(MirtError::Input(_))));
    }
}
