use crate::schema::{ForeignKey, StarTable};
use arrow::array::AsArray;
use arrow::datatypes::Int64Type;
use common::config::QualitySettings;
use common::{Error, Result};
use datafusion::common::{JoinType, TableReference};
use datafusion::dataframe::DataFrame;
use datafusion::execution::context::SessionContext;
use datafusion::functions_aggregate::expr_fn::count_distinct;
use datafusion::prelude::ident;
use std::fmt;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityCheck {
    NonEmpty,
    PrimaryKeyNotNull,
    PrimaryKeyUnique,
    ForeignKey(ForeignKey),
}

impl fmt::Display for QualityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityCheck::NonEmpty => f.write_str("non_empty"),
            QualityCheck::PrimaryKeyNotNull => f.write_str("primary_key_not_null"),
            QualityCheck::PrimaryKeyUnique => f.write_str("primary_key_unique"),
            QualityCheck::ForeignKey(fk) => write!(f, "foreign_key({} -> {})", fk.column, fk.references),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub table: StarTable,
    pub check: QualityCheck,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct QualityReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl QualityReport {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }

    fn record(&mut self, table: StarTable, check: QualityCheck, passed: bool, detail: String) {
        if passed {
            info!(table = table.name(), check = %check, detail, "Quality check passed");
        } else {
            error!(table = table.name(), check = %check, detail, "Quality check failed");
        }
        self.outcomes.push(CheckOutcome {
            table,
            check,
            passed,
            detail,
        });
    }
}

/// Runs the star-schema checks against tables registered in a session.
pub struct QualityChecker {
    require_non_empty: bool,
}

impl QualityChecker {
    pub fn new(settings: &QualitySettings) -> Self {
        Self {
            require_non_empty: settings.require_non_empty,
        }
    }

    /// Evaluates all checks and fails with `Error::DataQuality` if any of them
    /// did not pass.
    pub async fn run(&self, ctx: &SessionContext) -> Result<QualityReport> {
        let report = self.evaluate(ctx).await?;
        if report.passed() {
            return Ok(report);
        }
        let failed: Vec<String> = report
            .failures()
            .map(|o| format!("{}.{}: {}", o.table, o.check, o.detail))
            .collect();
        Err(Error::DataQuality(failed.join("; ")))
    }

    pub async fn evaluate(&self, ctx: &SessionContext) -> Result<QualityReport> {
        let mut report = QualityReport::default();

        for table in StarTable::ALL {
            let df = table_frame(ctx, table).await?;
            let rows = df.clone().count().await?;

            if self.require_non_empty {
                report.record(table, QualityCheck::NonEmpty, rows > 0, format!("{} rows", rows));
            }

            let key = table.primary_key();
            let nulls = df.clone().filter(ident(key).is_null())?.count().await?;
            report.record(
                table,
                QualityCheck::PrimaryKeyNotNull,
                nulls == 0,
                format!("{} null {} values", nulls, key),
            );

            let distinct = distinct_count(df.clone(), key).await?;
            let non_null = rows - nulls;
            report.record(
                table,
                QualityCheck::PrimaryKeyUnique,
                distinct == non_null,
                format!("{} distinct of {} keys", distinct, non_null),
            );

            for fk in table.foreign_keys() {
                let orphans = orphan_count(ctx, df.clone(), fk).await?;
                report.record(
                    table,
                    QualityCheck::ForeignKey(*fk),
                    orphans == 0,
                    format!("{} rows without a matching {}", orphans, fk.references),
                );
            }
        }

        Ok(report)
    }
}

async fn table_frame(ctx: &SessionContext, table: StarTable) -> Result<DataFrame> {
    ctx.table(TableReference::bare(table.name()))
        .await
        .map_err(|e| Error::DataQuality(format!("Table {} is not available: {}", table, e)))
}

// COUNT(DISTINCT) ignores nulls and is 0 on an empty table.
async fn distinct_count(df: DataFrame, column: &str) -> Result<usize> {
    let batches = df
        .aggregate(vec![], vec![count_distinct(ident(column)).alias("distinct_keys")])?
        .collect()
        .await?;
    let count = batches
        .iter()
        .find(|b| b.num_rows() > 0)
        .and_then(|b| b.column(0).as_primitive_opt::<Int64Type>())
        .map(|values| values.value(0))
        .unwrap_or(0);
    Ok(count as usize)
}

async fn orphan_count(ctx: &SessionContext, fact: DataFrame, fk: &ForeignKey) -> Result<usize> {
    let dimension = table_frame(ctx, fk.references)
        .await?
        .select(vec![ident(fk.references.primary_key())])?;
    let orphans = fact
        .select(vec![ident(fk.column)])?
        .join(
            dimension,
            JoinType::LeftAnti,
            &[fk.column],
            &[fk.references.primary_key()],
            None,
        )?
        .count()
        .await?;
    Ok(orphans)
}
