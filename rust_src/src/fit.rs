//! Fitting entry point and the converged model it returns.

use rand::SeedableRng;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::config::{FitOptions, Method};
use crate::data::{recode_with, PatternTable, ResponseMatrix};
use crate::em::run_em;
use crate::error::{raise, FitWarning, MirtError, MirtResult};
use crate::estep::estep;
use crate::mhrm::{final_loglik, run_mhrm};
use crate::model::{Model, ModelSpec, Owner, ParameterTable, Slot};
use crate::parallel::{Runtime, WorkerPool};
use crate::quadrature::QuadratureGrid;
use crate::scoring::{
    empirical_reliability, multiple_imputation, original_codes, FactorScores, OutputMode,
    ScoreInput, ScoreMethod, ScoreOptions, Scorer,
};
use crate::standard_errors::{compute_information, InformationMatrix, SeInputs};
use crate::utils::qnorm;

/// Slopes beyond this magnitude usually mean an unidentified or degenerate item.
const SLOPE_LIMIT: f64 = 50.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NullFit {
    pub loglik: f64,
    pub npars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitStatistics {
    pub loglik: f64,
    pub npars: usize,
    pub n: usize,
    pub aic: f64,
    pub aicc: f64,
    pub bic: f64,
    pub sabic: f64,
    /// Likelihood-ratio statistic against the saturated multinomial; complete data only
    pub g2: Option<f64>,
    pub df: Option<f64>,
    pub p: Option<f64>,
    pub rmsea: Option<f64>,
    pub cfi: Option<f64>,
    pub tli: Option<f64>,
}

/// One reported parameter with its delta-method standard error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coefficient {
    pub group: usize,
    pub item: Option<usize>,
    pub item_name: String,
    pub name: String,
    pub value: f64,
    pub free: bool,
    pub se: Option<f64>,
    pub ci: Option<(f64, f64)>,
}

#[derive(Debug, Clone)]
pub struct ConvergedModel {
    pub model: Model,
    pub loglik: f64,
    pub cycles: usize,
    pub converged: bool,
    pub warnings: Vec<FitWarning>,
    pub information: Option<InformationMatrix>,
    /// Observed log-likelihood per EM cycle; empty for MH-RM
    pub loglik_trace: Vec<f64>,
    pub null: Option<NullFit>,
    pub options: FitOptions,
    grid: Option<QuadratureGrid>,
    patterns: PatternTable,
    data: ResponseMatrix,
    pool: WorkerPool,
}

fn fit_grid(nfact: usize, opts: &FitOptions) -> MirtResult<QuadratureGrid> {
    let tech = &opts.technical;
    match &tech.custom_grid {
        Some(theta) => {
            if theta.ncols() != nfact {
                return Err(MirtError::Input(format!(
                    "custom grid has {} columns for a {}-factor model",
                    theta.ncols(),
                    nfact
                )));
            }
            QuadratureGrid::from_nodes(theta.clone(), tech.max_quad)
        }
        None => QuadratureGrid::build(nfact, opts.quadpts, tech.theta_lim, tech.max_quad),
    }
}

fn check_slopes(model: &Model, warnings: &mut Vec<FitWarning>) {
    for (g, gm) in model.groups.iter().enumerate() {
        for (j, item) in gm.items.iter().enumerate() {
            for p in item.slope_indices() {
                let value = item.pars[p].value;
                if value.abs() > SLOPE_LIMIT {
                    raise(
                        warnings,
                        FitWarning::SlopeOutOfRange {
                            group: g,
                            item: j,
                            name: item.pars[p].name.clone(),
                            value,
                        },
                    );
                }
            }
        }
    }
}

/// Independence-model fit used as the CFI/TLI baseline.
fn fit_null(
    model: &Model,
    patterns: &PatternTable,
    grid: &QuadratureGrid,
    opts: &FitOptions,
    runtime: &Runtime,
) -> MirtResult<NullFit> {
    let mut null = model.null_model()?;
    let null_opts = FitOptions {
        method: Method::Em,
        se: false,
        empirical_histogram: false,
        ..opts.clone()
    };
    log::info!("fitting the null model ({} free parameters)", null.npars());
    let out = run_em(&mut null, patterns, grid, &null_opts, runtime)?;
    Ok(NullFit {
        loglik: out.loglik,
        npars: null.npars(),
    })
}

/// Fit a MIRT model to `data` by marginal maximum likelihood (EM or MH-RM).
pub fn mirt(
    data: &ResponseMatrix,
    spec: &ModelSpec,
    opts: &FitOptions,
    runtime: &Runtime,
) -> MirtResult<ConvergedModel> {
    opts.validate(spec.nfact)?;
    let mut model = Model::build(data, spec)?;
    model.custom_prior = opts.technical.custom_prior.clone();
    let patterns = PatternTable::from_responses(data);
    let pool = &runtime.pool;

    let mut warnings = Vec::new();
    let (grid, loglik, cycles, converged, trajectory, loglik_trace, mhrm_info) = match opts.method {
        Method::Em => {
            let grid = fit_grid(model.nfact, opts)?;
            let out = run_em(&mut model, &patterns, &grid, opts, runtime)?;
            warnings.extend(out.warnings);
            (
                Some(grid),
                out.loglik,
                out.cycles,
                out.converged,
                out.trajectory,
                out.loglik_trace,
                None,
            )
        }
        Method::Mhrm => {
            let out = run_mhrm(&mut model, data, &patterns, opts, runtime)?;
            warnings.extend(out.warnings);
            let grid = match fit_grid(model.nfact, opts) {
                Ok(grid) => Some(grid),
                Err(MirtError::QuadratureTooLarge { .. }) => None,
                Err(e) => return Err(e),
            };
            (grid, out.loglik, out.cycles, out.converged, Vec::new(), Vec::new(), out.information)
        }
    };

    let null = match (&grid, opts.calc_null && !data.has_missing()) {
        (Some(grid), true) => Some(fit_null(&model, &patterns, grid, opts, runtime)?),
        (None, true) => {
            log::info!("null model skipped: quadrature grid exceeds MAXQUAD");
            None
        }
        _ => None,
    };

    let information = if opts.se {
        let inputs = SeInputs {
            model: &model,
            patterns: &patterns,
            grid: grid.as_ref(),
            opts,
            pool,
            trajectory: &trajectory,
            mhrm_information: mhrm_info.as_ref(),
        };
        let (info, se_warnings) = compute_information(&inputs)?;
        for w in se_warnings {
            raise(&mut warnings, w);
        }
        Some(info)
    } else {
        None
    };
    check_slopes(&model, &mut warnings);

    Ok(ConvergedModel {
        model,
        loglik,
        cycles,
        converged,
        warnings,
        information,
        loglik_trace,
        null,
        options: opts.clone(),
        grid,
        patterns,
        data: data.clone(),
        pool: pool.clone(),
    })
}

impl ConvergedModel {
    pub fn information(&self) -> MirtResult<&InformationMatrix> {
        self.information.as_ref().ok_or(MirtError::NotComputed("information matrix"))
    }

    pub fn data(&self) -> &ResponseMatrix {
        &self.data
    }

    pub fn patterns(&self) -> &PatternTable {
        &self.patterns
    }

    pub fn parameter_table(&self) -> ParameterTable {
        self.model.parameter_table()
    }

    /// Reported parameters with standard errors and `level` confidence intervals.
    ///
    /// Intervals are formed on the raw scale and mapped back, so g and u stay inside (0, 1).
    pub fn coef(&self, level: f64) -> MirtResult<Vec<Coefficient>> {
        if !(level > 0.0 && level < 1.0) {
            return Err(MirtError::Input(format!("confidence level {} is outside (0, 1)", level)));
        }
        let z = qnorm(1.0 - (1.0 - level) / 2.0);
        let layout = self.model.layout();
        let canon_of: std::collections::HashMap<Slot, usize> = layout
            .slots
            .iter()
            .zip(layout.canon_of_slot.iter())
            .map(|(&s, &c)| (s, c))
            .collect();
        let raw_se = self.information.as_ref().map(|info| info.raw_se());

        let mut out = Vec::new();
        let mut push = |owner: Owner, p: usize, item: Option<usize>, item_name: &str| {
            let g = owner.group();
            let par = self.model.param(owner, p);
            let se_raw = canon_of
                .get(&Slot { owner, par: p })
                .and_then(|&c| raw_se.as_ref().map(|se| se[c]))
                .filter(|s| s.is_finite());
            let raw = par.raw();
            out.push(Coefficient {
                group: g,
                item,
                item_name: item_name.to_string(),
                name: par.name.clone(),
                value: par.value,
                free: par.free,
                se: se_raw.map(|s| s * par.transform.jacobian(raw).abs()),
                ci: se_raw.map(|s| {
                    (
                        par.transform.from_raw(raw - z * s),
                        par.transform.from_raw(raw + z * s),
                    )
                }),
            });
        };
        for (g, gm) in self.model.groups.iter().enumerate() {
            for (j, item) in gm.items.iter().enumerate() {
                for p in 0..item.npars() {
                    push(Owner::Item { group: g, item: j }, p, Some(j), &item.name);
                }
            }
            for p in 0..gm.latent.pars.len() {
                push(Owner::Latent { group: g }, p, None, "GROUP");
            }
        }
        Ok(out)
    }

    /// Information criteria and, for complete data, G²-based fit indices.
    pub fn fit_statistics(&self) -> FitStatistics {
        let n = self.data.n_persons();
        let nf = n as f64;
        let k = self.model.npars() as f64;
        let dev = -2.0 * self.loglik;
        let aicc_denom = nf - k - 1.0;
        let mut stats = FitStatistics {
            loglik: self.loglik,
            npars: self.model.npars(),
            n,
            aic: dev + 2.0 * k,
            aicc: if aicc_denom > 0.0 {
                dev + 2.0 * k + 2.0 * k * (k + 1.0) / aicc_denom
            } else {
                f64::NAN
            },
            bic: dev + k * nf.ln(),
            sabic: dev + k * ((nf + 2.0) / 24.0).ln(),
            g2: None,
            df: None,
            p: None,
            rmsea: None,
            cfi: None,
            tli: None,
        };
        if self.data.has_missing() {
            return stats;
        }

        let saturated: f64 = (0..self.patterns.n_patterns())
            .map(|p| {
                let f = self.patterns.freq[p];
                f * (f / self.patterns.group_total(self.patterns.group[p])).ln()
            })
            .sum();
        let cells: f64 = self.data.n_categories().iter().map(|&c| c as f64).product::<f64>() - 1.0;
        let cells = cells * self.data.n_groups() as f64;
        let g2 = 2.0 * (saturated - self.loglik);
        let df = cells - k;
        stats.g2 = Some(g2);
        stats.df = Some(df);
        if df > 0.0 {
            stats.p = ChiSquared::new(df).ok().map(|chi| 1.0 - chi.cdf(g2.max(0.0)));
            stats.rmsea = Some(((g2 - df).max(0.0) / (df * (nf - 1.0))).sqrt());
        }
        if let Some(null) = &self.null {
            let g2_null = 2.0 * (saturated - null.loglik);
            let df_null = cells - null.npars as f64;
            let worst = (g2_null - df_null).max(g2 - df).max(0.0);
            if worst > 0.0 {
                stats.cfi = Some(1.0 - (g2 - df).max(0.0) / worst);
            }
            if df > 0.0 && df_null > 0.0 {
                let ratio_null = g2_null / df_null;
                if ratio_null != 1.0 {
                    stats.tli = Some((ratio_null - g2 / df) / (ratio_null - 1.0));
                }
            }
        }
        stats
    }

    /// Copy with parameter values taken from an edited table; the log-likelihood is
    /// recomputed and any information matrix dropped.
    pub fn with_parameter_table(&self, table: &ParameterTable) -> MirtResult<ConvergedModel> {
        let model = self.model.with_parameter_table(table)?;
        let loglik = match &self.grid {
            Some(grid) => estep(&model, &self.patterns, grid, &self.pool, false)?.loglik,
            None => {
                let mut rng = Pcg64::seed_from_u64(self.options.technical.seed);
                final_loglik(&model, &self.patterns, &self.options, &self.pool, &mut rng)?
            }
        };
        Ok(ConvergedModel {
            model,
            loglik,
            information: None,
            loglik_trace: Vec::new(),
            ..self.clone()
        })
    }

    fn scoring_grid(&self, opts: &ScoreOptions) -> MirtResult<QuadratureGrid> {
        let uses_fit_grid = self.model.groups.iter().any(|gm| gm.histogram.is_some())
            || self.options.technical.custom_grid.is_some();
        match (&self.grid, uses_fit_grid) {
            (Some(grid), true) => Ok(grid.clone()),
            _ => QuadratureGrid::build(
                self.model.nfact,
                opts.quadpts,
                opts.theta_lim,
                opts.max_quad,
            ),
        }
    }

    /// Factor scores for the fitted responses or for custom patterns.
    pub fn fscores(&self, opts: &ScoreOptions) -> MirtResult<FactorScores> {
        let (lo, hi) = opts.theta_lim;
        if !(lo < hi) {
            return Err(MirtError::Configuration("theta_lim must be increasing".into()));
        }
        if opts.method == ScoreMethod::EapSum && self.model.nfact != 1 {
            return Err(MirtError::Configuration("EAPsum scoring needs a single factor".into()));
        }
        let table = match &opts.input {
            ScoreInput::Fitted => self.patterns.clone(),
            ScoreInput::Patterns { responses, groups } => {
                let recoded = recode_with(&self.model.categories, responses)?;
                let groups = groups.clone().unwrap_or_else(|| vec![0; recoded.nrows()]);
                if groups.len() != recoded.nrows() {
                    return Err(MirtError::Input(format!(
                        "{} group labels for {} scoring rows",
                        groups.len(),
                        recoded.nrows()
                    )));
                }
                if let Some(&g) = groups.iter().find(|&&g| g >= self.model.n_groups()) {
                    return Err(MirtError::Input(format!("group {} is not in the fitted model", g)));
                }
                PatternTable::tabulate(&recoded, &groups, self.model.n_groups())
            }
        };

        let grid = self.scoring_grid(opts)?;
        log::info!(
            "scoring {} unique patterns by {:?} on {} nodes",
            table.n_patterns(),
            opts.method,
            grid.n_nodes()
        );
        let scorer = Scorer::new(&self.model, &grid, opts.theta_lim)?;
        let per_pattern = match opts.mi_draws {
            Some(m) if m > 0 => {
                let info = self.information()?;
                multiple_imputation(
                    &self.model,
                    &grid,
                    &table,
                    opts.method,
                    &info.vcov,
                    m,
                    opts,
                    &self.pool,
                )?
            }
            _ => scorer.score_table(opts.method, &table, &self.pool),
        };

        let reliability = opts
            .reliability
            .then(|| empirical_reliability(&per_pattern.scores, &per_pattern.se, &table.freq));
        let sum_scores = if opts.method == ScoreMethod::EapSum {
            Some(
                (0..self.model.n_groups())
                    .map(|g| scorer.sum_score_table(g, &table))
                    .collect::<MirtResult<Vec<_>>>()?,
            )
        } else {
            None
        };

        let codes = original_codes(&self.model.categories, &table.patterns);
        let out = match opts.output {
            OutputMode::Table => FactorScores {
                method: opts.method,
                output: opts.output,
                patterns: Some(codes),
                freq: Some(table.freq.clone()),
                groups: table.group.clone(),
                scores: per_pattern.scores,
                se: Some(per_pattern.se),
                flags: per_pattern.flags,
                reliability,
                sum_scores,
            },
            OutputMode::Full | OutputMode::ScoresOnly => {
                let rows = &table.row_pattern;
                let pick = |a: &ndarray::Array2<f64>| a.select(ndarray::Axis(0), rows);
                let full = opts.output == OutputMode::Full;
                FactorScores {
                    method: opts.method,
                    output: opts.output,
                    patterns: full.then(|| codes.select(ndarray::Axis(0), rows)),
                    freq: None,
                    groups: rows.iter().map(|&p| table.group[p]).collect(),
                    scores: pick(&per_pattern.scores),
                    se: full.then(|| pick(&per_pattern.se)),
                    flags: rows.iter().map(|&p| per_pattern.flags[p]).collect(),
                    reliability,
                    sum_scores,
                }
            }
        };
        Ok(out)
    }
}
