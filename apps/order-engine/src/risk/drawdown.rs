//! Equity drawdown tracking.

use rust_decimal::Decimal;

/// Tracks equity against its running peak and flags excessive drawdown.
///
/// The drawdown fraction is `(equity - peak) / peak`, which is zero at a new
/// high and negative below it.
#[derive(Debug, Clone)]
pub struct DrawdownTracker {
    alert_pct: Decimal,
    peak: Option<Decimal>,
    trough: Option<Decimal>,
    max_drawdown: Decimal,
}

impl DrawdownTracker {
    /// Create a tracker that alerts when `|drawdown| >= alert_pct`.
    #[must_use]
    pub const fn new(alert_pct: Decimal) -> Self {
        Self {
            alert_pct,
            peak: None,
            trough: None,
            max_drawdown: Decimal::ZERO,
        }
    }

    /// Record an equity sample.
    ///
    /// Returns `(drawdown_fraction, alert)` where the fraction is `<= 0`.
    pub fn record(&mut self, equity: Decimal) -> (Decimal, bool) {
        let peak = match self.peak {
            Some(peak) if equity > peak => {
                self.peak = Some(equity);
                equity
            }
            Some(peak) => peak,
            None => {
                self.peak = Some(equity);
                equity
            }
        };

        match self.trough {
            Some(trough) if equity < trough => self.trough = Some(equity),
            None => self.trough = Some(equity),
            Some(_) => {}
        }

        let fraction = if peak > Decimal::ZERO {
            (equity - peak) / peak
        } else {
            Decimal::ZERO
        };

        if fraction < self.max_drawdown {
            self.max_drawdown = fraction;
        }

        (fraction, fraction.abs() >= self.alert_pct)
    }

    /// Running equity peak, if any sample has been recorded.
    #[must_use]
    pub const fn peak(&self) -> Option<Decimal> {
        self.peak
    }

    /// Running equity trough, if any sample has been recorded.
    #[must_use]
    pub const fn trough(&self) -> Option<Decimal> {
        self.trough
    }

    /// Most negative drawdown fraction seen so far.
    #[must_use]
    pub const fn max_drawdown(&self) -> Decimal {
        self.max_drawdown
    }
}
