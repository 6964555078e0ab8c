//! Schema provisioning
//!
//! Tables are declared parent-first so every `REFERENCES` target exists
//! before the table that points at it. All DDL uses `IF NOT EXISTS`, so
//! [`SchemaProvisioner::ensure_schema`] can be re-run at any time; after a
//! partial failure, re-running picks up where the last run stopped.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{DbError, Result};
use crate::executor::QueryExecutor;
use crate::value::Row;

/// A table and the tables its foreign keys point at
#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    pub references: &'static [&'static str],
    pub ddl: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct IndexDef {
    pub name: &'static str,
    pub table: &'static str,
    pub ddl: &'static str,
}

pub const TABLES: &[TableDef] = &[
    TableDef {
        name: "organisation",
        references: &[],
        ddl: r#"
        CREATE TABLE IF NOT EXISTS organisation (
            org_id SERIAL PRIMARY KEY,
            name VARCHAR(100) NOT NULL,
            gst_no VARCHAR(20)
        )
        "#,
    },
    TableDef {
        name: "streets",
        references: &["organisation"],
        ddl: r#"
        CREATE TABLE IF NOT EXISTS streets (
            street_id SERIAL PRIMARY KEY,
            org_id INTEGER REFERENCES organisation(org_id),
            street_name VARCHAR(100) NOT NULL
        )
        "#,
    },
    TableDef {
        name: "plots",
        references: &["organisation", "streets"],
        ddl: r#"
        CREATE TABLE IF NOT EXISTS plots (
            plot_id SERIAL PRIMARY KEY,
            org_id INTEGER REFERENCES organisation(org_id),
            street_id INTEGER REFERENCES streets(street_id),
            plot_type VARCHAR(20) CHECK (plot_type IN ('Individual', 'Flats')),
            plot_no VARCHAR(50) NOT NULL
        )
        "#,
    },
    TableDef {
        name: "flats",
        references: &["plots"],
        ddl: r#"
        CREATE TABLE IF NOT EXISTS flats (
            flat_id SERIAL PRIMARY KEY,
            plot_id INTEGER REFERENCES plots(plot_id),
            flat_no VARCHAR(50),
            eb_card VARCHAR(50)
        )
        "#,
    },
    TableDef {
        name: "residents",
        references: &["plots", "flats"],
        ddl: r#"
        CREATE TABLE IF NOT EXISTS residents (
            resident_id SERIAL PRIMARY KEY,
            plot_id INTEGER REFERENCES plots(plot_id),
            flat_id INTEGER REFERENCES flats(flat_id),
            name VARCHAR(100) NOT NULL,
            contact_number VARCHAR(15),
            email VARCHAR(100),
            id_proof VARCHAR(50),
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    },
    TableDef {
        name: "users_login",
        references: &["organisation", "plots", "residents"],
        ddl: r#"
        CREATE TABLE IF NOT EXISTS users_login (
            user_id SERIAL PRIMARY KEY,
            user_name VARCHAR(100) NOT NULL UNIQUE,
            password VARCHAR(255) NOT NULL,
            org_id INTEGER REFERENCES organisation(org_id),
            plot_id INTEGER REFERENCES plots(plot_id),
            resident_id INTEGER REFERENCES residents(resident_id),
            user_type VARCHAR(10) CHECK (user_type IN ('owner', 'tenant', 'admin')),
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            last_login TIMESTAMP
        )
        "#,
    },
    TableDef {
        name: "payments",
        references: &["plots", "residents"],
        ddl: r#"
        CREATE TABLE IF NOT EXISTS payments (
            payment_id SERIAL PRIMARY KEY,
            plot_id INTEGER REFERENCES plots(plot_id),
            resident_id INTEGER REFERENCES residents(resident_id),
            amount DECIMAL(10,2) NOT NULL,
            payment_type VARCHAR(50) NOT NULL,
            payment_date DATE DEFAULT CURRENT_DATE,
            due_date DATE,
            status VARCHAR(20) DEFAULT 'pending' CHECK (status IN ('pending', 'paid', 'overdue')),
            payment_method VARCHAR(30),
            transaction_id VARCHAR(100),
            notes TEXT,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    },
    TableDef {
        name: "notifications",
        references: &["users_login"],
        ddl: r#"
        CREATE TABLE IF NOT EXISTS notifications (
            notification_id SERIAL PRIMARY KEY,
            title VARCHAR(200) NOT NULL,
            message TEXT NOT NULL,
            sender_id INTEGER REFERENCES users_login(user_id),
            recipient_type VARCHAR(20) CHECK (recipient_type IN ('all', 'street', 'plot', 'individual')),
            recipient_id INTEGER,
            status VARCHAR(20) DEFAULT 'unread' CHECK (status IN ('read', 'unread')),
            priority VARCHAR(10) DEFAULT 'normal' CHECK (priority IN ('low', 'normal', 'high', 'urgent')),
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            read_at TIMESTAMP
        )
        "#,
    },
    TableDef {
        name: "maintenance_requests",
        references: &["plots", "residents"],
        ddl: r#"
        CREATE TABLE IF NOT EXISTS maintenance_requests (
            request_id SERIAL PRIMARY KEY,
            plot_id INTEGER REFERENCES plots(plot_id),
            resident_id INTEGER REFERENCES residents(resident_id),
            title VARCHAR(200) NOT NULL,
            description TEXT NOT NULL,
            category VARCHAR(50),
            priority VARCHAR(10) DEFAULT 'normal' CHECK (priority IN ('low', 'normal', 'high', 'urgent')),
            status VARCHAR(20) DEFAULT 'open' CHECK (status IN ('open', 'in_progress', 'resolved', 'closed')),
            assigned_to VARCHAR(100),
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            resolved_at TIMESTAMP
        )
        "#,
    },
    TableDef {
        name: "community_expenses",
        references: &["organisation", "users_login"],
        ddl: r#"
        CREATE TABLE IF NOT EXISTS community_expenses (
            expense_id SERIAL PRIMARY KEY,
            org_id INTEGER REFERENCES organisation(org_id),
            expense_type VARCHAR(50) NOT NULL,
            description TEXT NOT NULL,
            amount DECIMAL(10,2) NOT NULL,
            expense_date DATE DEFAULT CURRENT_DATE,
            vendor_name VARCHAR(100),
            receipt_number VARCHAR(50),
            approved_by INTEGER REFERENCES users_login(user_id),
            status VARCHAR(20) DEFAULT 'pending' CHECK (status IN ('pending', 'approved', 'paid')),
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    },
    TableDef {
        name: "visitor_logs",
        references: &["plots", "residents"],
        ddl: r#"
        CREATE TABLE IF NOT EXISTS visitor_logs (
            log_id SERIAL PRIMARY KEY,
            plot_id INTEGER REFERENCES plots(plot_id),
            visitor_name VARCHAR(100) NOT NULL,
            visitor_phone VARCHAR(15),
            purpose VARCHAR(200),
            entry_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            exit_time TIMESTAMP,
            approved_by INTEGER REFERENCES residents(resident_id),
            security_guard VARCHAR(100)
        )
        "#,
    },
];

pub const INDEXES: &[IndexDef] = &[
    IndexDef {
        name: "idx_users_login_username",
        table: "users_login",
        ddl: "CREATE INDEX IF NOT EXISTS idx_users_login_username ON users_login(user_name)",
    },
    IndexDef {
        name: "idx_users_login_plot",
        table: "users_login",
        ddl: "CREATE INDEX IF NOT EXISTS idx_users_login_plot ON users_login(plot_id)",
    },
    IndexDef {
        name: "idx_residents_plot",
        table: "residents",
        ddl: "CREATE INDEX IF NOT EXISTS idx_residents_plot ON residents(plot_id)",
    },
    IndexDef {
        name: "idx_payments_resident",
        table: "payments",
        ddl: "CREATE INDEX IF NOT EXISTS idx_payments_resident ON payments(resident_id)",
    },
    IndexDef {
        name: "idx_payments_plot",
        table: "payments",
        ddl: "CREATE INDEX IF NOT EXISTS idx_payments_plot ON payments(plot_id)",
    },
];

/// Sample community inserted by [`SchemaProvisioner::seed_sample_data`].
/// Ids assume a freshly provisioned, empty schema.
const SEED_STATEMENTS: &[(&str, &str)] = &[
    (
        "organisation",
        "INSERT INTO organisation (name, gst_no) VALUES ('Green Valley Residency', 'GSTIN123456')",
    ),
    (
        "streets",
        "INSERT INTO streets (org_id, street_name) VALUES (1, 'Palm Street'), (1, 'Lake View Road')",
    ),
    (
        "plots",
        r#"
        INSERT INTO plots (org_id, street_id, plot_type, plot_no) VALUES
            (1, 1, 'Individual', 'P-101'),
            (1, 1, 'Flats', 'P-102'),
            (1, 2, 'Flats', 'P-201')
        "#,
    ),
    (
        "flats",
        r#"
        INSERT INTO flats (plot_id, flat_no, eb_card) VALUES
            (2, 'F1', 'EB001'),
            (2, 'F2', 'EB002'),
            (3, 'F1', 'EB003')
        "#,
    ),
    (
        "residents",
        r#"
        INSERT INTO residents (plot_id, flat_id, name, contact_number, email, id_proof) VALUES
            (1, NULL, 'Ravi Kumar', '9876543210', 'ravi@example.com', 'ID123'),
            (2, 1, 'Sneha Mehta', '9123456780', 'sneha@example.com', 'ID456'),
            (2, 2, 'Amit Shah', '9988776655', 'amit@example.com', 'ID789')
        "#,
    ),
    (
        "users_login",
        r#"
        INSERT INTO users_login (user_name, password, org_id, plot_id, resident_id, user_type) VALUES
            ('admin', 'admin123', 1, NULL, NULL, 'admin'),
            ('ravi_k', 'pass123', 1, 1, 1, 'owner')
        "#,
    ),
];

/// Objects ensured by one provisioning run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaReport {
    pub tables: Vec<String>,
    pub indexes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStatus {
    pub name: String,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySummary {
    pub total_tables: usize,
    pub existing_tables: usize,
    pub total_records: i64,
}

/// Per-table existence and row counts, plus who we are connected as
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub database: Option<String>,
    pub user: Option<String>,
    pub version: Option<String>,
    pub tables: Vec<TableStatus>,
    pub summary: VerifySummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Seeded,
    AlreadyPresent,
}

/// Creates, verifies and seeds the community schema
#[derive(Debug, Clone)]
pub struct SchemaProvisioner {
    executor: QueryExecutor,
}

impl SchemaProvisioner {
    pub fn new(executor: QueryExecutor) -> Self {
        Self { executor }
    }

    pub fn tables() -> impl Iterator<Item = &'static str> {
        TABLES.iter().map(|t| t.name)
    }

    pub fn indexes() -> impl Iterator<Item = &'static str> {
        INDEXES.iter().map(|i| i.name)
    }

    /// Create every declared table and index that does not exist yet.
    ///
    /// Stops at the first failure with [`DbError::Provisioning`]; objects
    /// created before it are left in place.
    pub async fn ensure_schema(&self) -> Result<SchemaReport> {
        info!(tables = TABLES.len(), indexes = INDEXES.len(), "ensuring schema");

        for table in TABLES {
            self.run_ddl(table.name, table.ddl).await?;
            debug!(table = table.name, "table ensured");
        }
        for index in INDEXES {
            self.run_ddl(index.name, index.ddl).await?;
            debug!(index = index.name, table = index.table, "index ensured");
        }

        info!("schema ensured");
        Ok(SchemaReport {
            tables: Self::tables().map(str::to_owned).collect(),
            indexes: Self::indexes().map(str::to_owned).collect(),
        })
    }

    async fn run_ddl(&self, object: &str, ddl: &str) -> Result<()> {
        match self.executor.execute(ddl, &[]).await {
            Ok(_) => Ok(()),
            Err(err @ (DbError::AcquisitionTimeout { .. } | DbError::PoolClosed)) => Err(err),
            Err(err) => {
                warn!(object, error = %err, "schema provisioning failed");
                Err(DbError::Provisioning {
                    object: object.to_owned(),
                    message: err.message(),
                    detail: err.detail().map(str::to_owned),
                })
            }
        }
    }

    /// Check each declared table and count its rows.
    ///
    /// A missing or unreadable table is reported, not raised.
    pub async fn verify_schema(&self) -> Result<VerifyReport> {
        let mut tables = Vec::with_capacity(TABLES.len());
        for table in TABLES {
            // Table names come from the fixed declaration above.
            let sql = format!("SELECT COUNT(*) AS count FROM {}", table.name);
            let status = match self.executor.fetch_one(&sql, &[]).await {
                Ok(row) => TableStatus {
                    name: table.name.to_owned(),
                    exists: true,
                    record_count: Some(int_field(&row, "count").unwrap_or(0)),
                    error: None,
                },
                Err(err) => TableStatus {
                    name: table.name.to_owned(),
                    exists: false,
                    record_count: None,
                    error: Some(err.message()),
                },
            };
            tables.push(status);
        }

        let info = self
            .executor
            .fetch_one(
                r#"SELECT current_database() AS database, current_user AS "user", version() AS version"#,
                &[],
            )
            .await?;

        let summary = VerifySummary {
            total_tables: tables.len(),
            existing_tables: tables.iter().filter(|t| t.exists).count(),
            total_records: tables.iter().filter_map(|t| t.record_count).sum(),
        };

        Ok(VerifyReport {
            database: text_field(&info, "database"),
            user: text_field(&info, "user"),
            version: text_field(&info, "version"),
            tables,
            summary,
        })
    }

    /// Insert the sample community when `organisation` is empty.
    ///
    /// All inserts run in one transaction on one connection, so a failure
    /// leaves nothing behind and a later run seeds from scratch. A
    /// connection-level failure retries the whole transaction under the
    /// executor's retry policy.
    pub async fn seed_sample_data(&self) -> Result<SeedOutcome> {
        let row = self
            .executor
            .fetch_one("SELECT COUNT(*) AS count FROM organisation", &[])
            .await?;
        if int_field(&row, "count").unwrap_or(0) > 0 {
            info!("sample data already present");
            return Ok(SeedOutcome::AlreadyPresent);
        }

        let policy = self.executor.policy();
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.seed_in_transaction().await {
                Ok(()) => break,
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    warn!(attempt, error = %err, "seeding interrupted, retrying");
                    tokio::time::sleep(policy.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }

        info!("sample data inserted");
        Ok(SeedOutcome::Seeded)
    }

    async fn seed_in_transaction(&self) -> Result<()> {
        let mut conn = self.executor.pool().acquire().await?;
        conn.query("BEGIN", &[]).await?;

        for (table, sql) in SEED_STATEMENTS {
            if let Err(err) = conn.query(sql, &[]).await {
                warn!(table, error = %err, "seeding failed, rolling back");
                // a broken connection is discarded and the server aborts the
                // transaction with the session
                if !err.is_transient() {
                    if let Err(rollback) = conn.query("ROLLBACK", &[]).await {
                        debug!(error = %rollback, "rollback failed");
                        conn.mark_broken();
                    }
                }
                return Err(err);
            }
            debug!(table, "sample rows inserted");
        }

        conn.query("COMMIT", &[]).await?;
        Ok(())
    }
}

fn int_field(row: &Row, key: &str) -> Option<i64> {
    let value = row.get(key)?;
    // COUNT(*) is INT8; tolerate a string-encoded numeric as well
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn text_field(row: &Row, key: &str) -> Option<String> {
    row.get(key).and_then(|v| v.as_str()).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_declared_parent_first() {
        for (pos, table) in TABLES.iter().enumerate() {
            for parent in table.references {
                let parent_pos = TABLES
                    .iter()
                    .position(|t| t.name == *parent)
                    .unwrap_or_else(|| panic!("{} references undeclared {}", table.name, parent));
                assert!(
                    parent_pos < pos,
                    "{} must be declared after {}",
                    table.name,
                    parent
                );
            }
        }
    }

    #[test]
    fn declared_references_match_ddl() {
        for table in TABLES {
            for parent in table.references {
                assert!(
                    table.ddl.contains(&format!("REFERENCES {parent}(")),
                    "{} ddl does not reference {}",
                    table.name,
                    parent
                );
            }
            assert!(table.ddl.contains(&format!("CREATE TABLE IF NOT EXISTS {} (", table.name)));
        }
    }

    #[test]
    fn indexes_target_declared_tables() {
        for index in INDEXES {
            assert!(TABLES.iter().any(|t| t.name == index.table));
            assert!(index.ddl.starts_with(&format!("CREATE INDEX IF NOT EXISTS {} ", index.name)));
        }
    }

    #[test]
    fn eleven_tables_five_indexes() {
        assert_eq!(SchemaProvisioner::tables().count(), 11);
        assert_eq!(SchemaProvisioner::indexes().count(), 5);
    }
}
