//! Decide cuándo pedir la próxima tarea mientras la actual todavía corre,
//! para que la descarga termine justo cuando la GPU se libera.

use std::time::Duration;

use common::Progress;

/// z para un intervalo de confianza del 95 %.
const Z_95: f64 = 1.96;

/// Media y varianza incrementales (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Desvío muestral. Con menos de dos muestras es 0.
    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }

    /// Cota superior pesimista: media + 1.96 desvíos.
    pub fn upper(&self) -> Option<f64> {
        self.mean().map(|m| m + Z_95 * self.std_dev())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrefetchRules {
    /// Fracción restante del total que dispara el prefetch.
    pub remaining_fraction: f64,
    /// Unidades restantes que disparan el prefetch.
    pub remaining_units: u64,
}

impl Default for PrefetchRules {
    fn default() -> Self {
        Self {
            remaining_fraction: 0.25,
            remaining_units: 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrefetchPredictor {
    rules: PrefetchRules,
    download_secs: RunningStats,
    unit_secs: RunningStats,
}

impl PrefetchPredictor {
    pub fn new(rules: PrefetchRules) -> Self {
        Self {
            rules,
            ..Default::default()
        }
    }

    pub fn record_download(&mut self, took: Duration) {
        self.download_secs.push(took.as_secs_f64());
    }

    /// Una muestra por observación: `units` unidades que tardaron `took`.
    pub fn record_units(&mut self, took: Duration, units: u64) {
        if units > 0 {
            self.unit_secs.push(took.as_secs_f64() / units as f64);
        }
    }

    pub fn download_stats(&self) -> RunningStats {
        self.download_secs
    }

    pub fn unit_stats(&self) -> RunningStats {
        self.unit_secs
    }

    /// Segundos estimados (pesimistas) para terminar `remaining` unidades.
    pub fn eta_upper(&self, remaining: u64) -> Option<f64> {
        self.unit_secs.upper().map(|u| remaining as f64 * u)
    }

    /// True si conviene pedir la próxima tarea ya.
    pub fn should_prefetch(&self, progress: &Progress) -> bool {
        let (Some(total), Some(remaining)) = (progress.total, progress.remaining()) else {
            return false;
        };
        if total == 0 {
            return false;
        }

        if remaining as f64 <= total as f64 * self.rules.remaining_fraction {
            return true;
        }
        if remaining <= self.rules.remaining_units {
            return true;
        }
        match (self.eta_upper(remaining), self.download_secs.upper()) {
            (Some(eta), Some(download)) => eta <= download,
            _ => false,
        }
    }
}

/// Alimenta el predictor con el avance de una tarea y avisa una sola vez.
#[derive(Debug)]
pub struct ProgressWatch {
    last: Option<(u64, tokio::time::Instant)>,
    fired: bool,
}

impl Default for ProgressWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressWatch {
    pub fn new() -> Self {
        Self {
            last: None,
            fired: false,
        }
    }

    /// Registra el tiempo por unidad desde la última observación y devuelve
    /// true la primera vez que el predictor pide prefetch.
    pub fn observe(
        &mut self,
        predictor: &mut PrefetchPredictor,
        progress: &Progress,
        now: tokio::time::Instant,
    ) -> bool {
        if let Some(current) = progress.current {
            match self.last {
                Some((prev, at)) if current > prev => {
                    predictor.record_units(now.duration_since(at), current - prev);
                    self.last = Some((current, now));
                }
                None => self.last = Some((current, now)),
                _ => {}
            }
        }

        if !self.fired && predictor.should_prefetch(progress) {
            self.fired = true;
            return true;
        }
        false
    }

    pub fn fired(&self) -> bool {
        self.fired
    }
}
