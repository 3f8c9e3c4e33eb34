use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use common::{
    Account, Bar, CircuitBreakerStatus, MarketData, Position, RejectionReason, Result, Signal,
};

use crate::config::{default_sectors, RiskConfig};

/// Breaker at or above this fraction of a limit reports WARNING.
pub const WARNING_FRACTION: f64 = 0.8;

/// Fewer paired returns than this and no correlation is reported.
pub const MIN_CORRELATION_SAMPLES: usize = 5;

/// Result of one circuit breaker evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CircuitBreakerCheck {
    pub status: CircuitBreakerStatus,
    /// Loss since the day-start equity, as a fraction (positive = loss).
    pub daily_loss: f64,
    /// Loss from peak equity, as a fraction.
    pub drawdown: f64,
    pub day_start_equity: f64,
    pub peak_equity: f64,
}

/// What the risk checks see of the portfolio for one signal.
#[derive(Debug, Clone, Copy)]
pub struct PortfolioSnapshot<'a> {
    pub account: &'a Account,
    pub positions: &'a [Position],
    pub market_data: &'a MarketData,
    /// BUY signals already accepted earlier in the same batch.
    pub pending: &'a [Signal],
}

#[derive(Debug, Default)]
struct BreakerState {
    day: Option<NaiveDate>,
    day_start_equity: f64,
    peak_equity: f64,
    status: CircuitBreakerStatus,
    trades_today: u32,
}

/// Portfolio-wide guardrails applied to every new entry.
///
/// Exits are never blocked: a SELL passes regardless of breaker state so
/// open positions can still be managed.
pub struct RiskManager {
    config: RiskConfig,
    sectors: HashMap<String, String>,
    breaker: BreakerState,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Result<Self> {
        config.validate()?;
        let mut sectors: HashMap<String, String> = default_sectors().into_iter().collect();
        sectors.extend(config.sectors.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(Self {
            config,
            sectors,
            breaker: BreakerState::default(),
        })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn circuit_breaker_status(&self) -> CircuitBreakerStatus {
        self.breaker.status
    }

    pub fn trades_today(&self) -> u32 {
        self.breaker.trades_today
    }

    pub fn sector_of(&self, symbol: &str) -> Option<&str> {
        self.sectors.get(symbol).map(String::as_str)
    }

    // ─── Circuit breakers ─────────────────────────────────────────────────────

    /// Update day-start and peak equity and recompute the breaker status.
    ///
    /// The first call of each `date` resets the day-start equity and the
    /// trade counter. Peak equity only ever ratchets up.
    pub fn check_circuit_breakers(&mut self, equity: f64, date: NaiveDate) -> CircuitBreakerCheck {
        let b = &mut self.breaker;
        if b.day != Some(date) {
            if b.day.is_some() {
                info!(%date, equity, trades = b.trades_today, "New trading day, daily limits reset");
            }
            b.day = Some(date);
            b.day_start_equity = equity;
            b.trades_today = 0;
        }
        if equity > b.peak_equity {
            b.peak_equity = equity;
        }

        let daily_loss = loss_fraction(b.day_start_equity, equity);
        let drawdown = loss_fraction(b.peak_equity, equity);
        let limits = &self.config.limits;

        let status = if daily_loss >= limits.max_daily_loss || drawdown >= limits.max_drawdown {
            CircuitBreakerStatus::Triggered
        } else if daily_loss >= limits.max_daily_loss * WARNING_FRACTION
            || drawdown >= limits.max_drawdown * WARNING_FRACTION
        {
            CircuitBreakerStatus::Warning
        } else {
            CircuitBreakerStatus::Normal
        };

        if status != b.status {
            let (from, to) = (b.status, status);
            match status {
                CircuitBreakerStatus::Triggered => warn!(
                    %from, %to,
                    daily_loss_pct = daily_loss * 100.0,
                    drawdown_pct = drawdown * 100.0,
                    "Circuit breaker TRIGGERED, new entries blocked"
                ),
                _ => info!(
                    %from, %to,
                    daily_loss_pct = daily_loss * 100.0,
                    drawdown_pct = drawdown * 100.0,
                    "Circuit breaker status changed"
                ),
            }
            b.status = status;
        }

        CircuitBreakerCheck {
            status,
            daily_loss,
            drawdown,
            day_start_equity: b.day_start_equity,
            peak_equity: b.peak_equity,
        }
    }

    /// Count one executed entry against the daily trade limit.
    pub fn record_trade(&mut self) {
        self.breaker.trades_today += 1;
        debug!(trades = self.breaker.trades_today, "Trade recorded");
    }

    // ─── Portfolio heat ───────────────────────────────────────────────────────

    /// Open risk of positions plus `pending` entries, as a fraction of equity.
    ///
    /// Risk is `|entry - stop| * quantity`; anything without a stop is
    /// charged `default_stop_loss_pct` of its entry price.
    pub fn calculate_portfolio_heat(&self, positions: &[Position], pending: &[Signal], equity: f64) -> f64 {
        if equity <= 0.0 {
            return f64::INFINITY;
        }
        let default_pct = self.config.default_stop_loss_pct;
        let position_risk: f64 = positions
            .iter()
            .filter(|p| p.quantity != 0.0)
            .map(|p| {
                let stop = p.stop_loss.unwrap_or(p.entry_price * (1.0 - default_pct));
                (p.entry_price - stop).abs() * p.quantity.abs()
            })
            .sum();
        let pending_risk: f64 = pending
            .iter()
            .filter(|s| s.is_buy())
            .map(|s| {
                let stop = s.stop_loss.unwrap_or(s.price * (1.0 - default_pct));
                (s.price - stop).abs() * s.position_size.unwrap_or(0.0).abs()
            })
            .sum();
        (position_risk + pending_risk) / equity
    }

    // ─── Correlation ──────────────────────────────────────────────────────────

    /// Pearson correlation of daily returns over the configured lookback.
    /// Bars are joined on timestamp first; days missing from either series,
    /// or with a non-positive close, are dropped.
    pub fn calculate_position_correlation(&self, bars_a: &[Bar], bars_b: &[Bar]) -> Option<f64> {
        let closes_b: HashMap<DateTime<Utc>, f64> = bars_b
            .iter()
            .filter(|b| b.close > 0.0)
            .map(|b| (b.timestamp, b.close))
            .collect();
        let joined: Vec<(f64, f64)> = bars_a
            .iter()
            .filter(|a| a.close > 0.0)
            .filter_map(|a| closes_b.get(&a.timestamp).map(|&b| (a.close, b)))
            .collect();
        let window = self.config.correlation_lookback_days + 1;
        let (a, b) = paired_returns(tail(&joined, window));
        pearson(&a, &b)
    }

    fn check_correlation(&self, signal: &Signal, snapshot: &PortfolioSnapshot<'_>) -> Result<(), RejectionReason> {
        let Some(candidate) = snapshot.market_data.bars(&signal.symbol) else {
            return Ok(());
        };
        let limit = self.config.limits.max_position_correlation;

        let held = snapshot
            .positions
            .iter()
            .filter(|p| p.quantity != 0.0)
            .map(|p| p.symbol.as_str())
            .chain(snapshot.pending.iter().filter(|s| s.is_buy()).map(|s| s.symbol.as_str()))
            .filter(|s| *s != signal.symbol);

        for symbol in held {
            let Some(held_bars) = snapshot.market_data.bars(symbol) else {
                continue;
            };
            if let Some(correlation) = self.calculate_position_correlation(candidate, held_bars) {
                if correlation > limit {
                    return Err(RejectionReason::Correlation {
                        symbol: signal.symbol.clone(),
                        held: symbol.to_string(),
                        correlation,
                        limit,
                    });
                }
            }
        }
        Ok(())
    }

    // ─── Sector exposure ──────────────────────────────────────────────────────

    /// Post-trade exposure of the candidate's sector. Symbols without a
    /// sector mapping are not checked.
    pub fn check_sector_exposure(
        &self,
        signal: &Signal,
        positions: &[Position],
        pending: &[Signal],
        equity: f64,
    ) -> Result<(), RejectionReason> {
        let Some(sector) = self.sector_of(&signal.symbol) else {
            return Ok(());
        };
        if equity <= 0.0 {
            return Err(RejectionReason::Other("non-positive equity".into()));
        }
        let in_sector = |symbol: &str| self.sector_of(symbol) == Some(sector);

        let held: f64 = positions
            .iter()
            .filter(|p| in_sector(&p.symbol))
            .map(|p| p.market_value.abs())
            .sum();
        let queued: f64 = pending
            .iter()
            .filter(|s| s.is_buy() && in_sector(&s.symbol))
            .map(Signal::notional)
            .sum();
        let exposure = (held + queued + signal.notional()) / equity;
        let limit = self.config.limits.max_sector_exposure;

        if exposure > limit {
            return Err(RejectionReason::SectorExposure {
                sector: sector.to_string(),
                exposure,
                limit,
            });
        }
        Ok(())
    }

    // ─── Validation ───────────────────────────────────────────────────────────

    /// Run every check against a BUY signal, stopping at the first failure.
    /// SELL and HOLD signals always pass.
    pub fn validate_signal(&self, signal: &Signal, snapshot: &PortfolioSnapshot<'_>) -> Result<(), RejectionReason> {
        if !signal.is_buy() {
            return Ok(());
        }
        if !(signal.price.is_finite() && signal.price > 0.0) {
            return Err(RejectionReason::InvalidSignal(format!("price {} is not positive", signal.price)));
        }

        let limits = &self.config.limits;

        if self.breaker.status == CircuitBreakerStatus::Triggered {
            return Err(RejectionReason::CircuitBreaker { status: self.breaker.status });
        }

        if self.breaker.trades_today >= limits.max_daily_trades {
            return Err(RejectionReason::DailyTradeLimit {
                trades: self.breaker.trades_today,
                limit: limits.max_daily_trades,
            });
        }

        let open = snapshot.positions.iter().filter(|p| p.quantity != 0.0).count()
            + snapshot.pending.iter().filter(|s| s.is_buy()).count();
        if open >= limits.max_open_positions {
            return Err(RejectionReason::MaxOpenPositions { open, limit: limits.max_open_positions });
        }

        let mut with_candidate = snapshot.pending.to_vec();
        with_candidate.push(signal.clone());
        let heat = self.calculate_portfolio_heat(snapshot.positions, &with_candidate, snapshot.account.equity);
        if heat > limits.max_portfolio_heat {
            return Err(RejectionReason::PortfolioHeat { heat, limit: limits.max_portfolio_heat });
        }

        self.check_correlation(signal, snapshot)?;

        self.check_sector_exposure(signal, snapshot.positions, snapshot.pending, snapshot.account.equity)
    }

    /// Validate `signals` in order; each accepted BUY counts as pending for
    /// the ones after it. Rejections are logged and dropped.
    pub fn validate_batch(
        &self,
        signals: Vec<Signal>,
        account: &Account,
        positions: &[Position],
        market_data: &MarketData,
    ) -> Vec<Signal> {
        let mut pending: Vec<Signal> = Vec::new();
        let mut accepted = Vec::with_capacity(signals.len());

        for signal in signals {
            let snapshot = PortfolioSnapshot {
                account,
                positions,
                market_data,
                pending: &pending,
            };
            match self.validate_signal(&signal, &snapshot) {
                Ok(()) => {
                    if signal.is_buy() {
                        pending.push(signal.clone());
                    }
                    accepted.push(signal);
                }
                Err(reason) => {
                    warn!(
                        symbol = %signal.symbol,
                        side = %signal.signal_type,
                        strategy = signal.strategy().unwrap_or("-"),
                        %reason,
                        "Signal rejected by RiskManager"
                    );
                }
            }
        }
        accepted
    }
}

fn loss_fraction(reference: f64, equity: f64) -> f64 {
    if reference <= 0.0 {
        return 0.0;
    }
    ((reference - equity) / reference).max(0.0)
}

fn tail<T>(values: &[T], n: usize) -> &[T] {
    &values[values.len().saturating_sub(n)..]
}

/// Step returns of two date-joined close series, kept pairwise.
fn paired_returns(joined: &[(f64, f64)]) -> (Vec<f64>, Vec<f64>) {
    joined
        .windows(2)
        .map(|w| (w[1].0 / w[0].0 - 1.0, w[1].1 / w[0].1 - 1.0))
        .unzip()
}

fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len();
    if n < MIN_CORRELATION_SAMPLES || n != b.len() {
        return None;
    }
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return None;
    }
    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
