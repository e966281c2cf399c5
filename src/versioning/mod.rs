//! Branches, turns and visibility resolution.
//!
//! Every versioned row is written inside a *turn* — an atomic unit of
//! change on a *branch*. Branches fork from a turn index of their parent;
//! a read at a branch sees the committed turns of the branch itself plus,
//! recursively, the parent's committed turns up to the fork point. The
//! recursive hierarchy walk is emitted as a `WITH RECURSIVE` CTE that
//! query sets join against.

pub mod context;

use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::pool::Db;
use crate::sql::ast::{CteBody, Expr, FromItem, JoinKind, OrderBy, SelectQuery, TableRef};
use crate::value::SqlValue;

pub const BRANCHES_TABLE: &str = "branches";
pub const TURNS_TABLE: &str = "turns";

/// The implicit root branch every database starts with.
pub const ROOT_BRANCH_ID: i32 = 1;

/// Turn lifecycle. Transitions are `staged → committed` and
/// `staged → reverted`; nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Staged,
    Committed,
    Reverted,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Staged => "staged",
            TurnStatus::Committed => "committed",
            TurnStatus::Reverted => "reverted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "staged" => Ok(TurnStatus::Staged),
            "committed" => Ok(TurnStatus::Committed),
            "reverted" => Ok(TurnStatus::Reverted),
            other => Err(Error::decode("status", format!("unknown turn status '{other}'"))),
        }
    }
}

/// A line of development. Never destroyed; forks only.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub id: i32,
    pub name: Option<String>,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
    pub forked_from_index: Option<i32>,
    pub forked_from_branch_id: Option<i32>,
    pub current_index: i32,
}

/// One atomic unit of change on a branch.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub id: i32,
    pub created_at: chrono::NaiveDateTime,
    pub ended_at: Option<chrono::NaiveDateTime>,
    pub index: i32,
    pub status: TurnStatus,
    pub message: Option<String>,
    pub metadata: JsonValue,
    pub trace_id: Option<String>,
    pub branch_id: i32,
}

/// A branch hanging off a turn, as returned by [`Branch::turns`].
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct ForkedBranchRef {
    pub id: i32,
    pub name: Option<String>,
    pub forked_from_index: Option<i32>,
    pub forked_from_branch_id: Option<i32>,
}

/// A turn together with the branches forked from it.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnWithForks {
    pub turn: Turn,
    pub forked_branches: Vec<ForkedBranchRef>,
}

/// DDL for the versioning tables. Idempotent.
pub fn versioning_ddl() -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS "{BRANCHES_TABLE}" (
    "id" SERIAL PRIMARY KEY,
    "name" TEXT,
    "created_at" TIMESTAMP NOT NULL DEFAULT NOW(),
    "updated_at" TIMESTAMP NOT NULL DEFAULT NOW(),
    "forked_from_index" INTEGER,
    "forked_from_branch_id" INTEGER REFERENCES "{BRANCHES_TABLE}" ("id"),
    "current_index" INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS "{TURNS_TABLE}" (
    "id" SERIAL PRIMARY KEY,
    "created_at" TIMESTAMP NOT NULL DEFAULT NOW(),
    "ended_at" TIMESTAMP,
    "index" INTEGER NOT NULL,
    "status" TEXT NOT NULL,
    "message" TEXT,
    "metadata" JSONB NOT NULL DEFAULT '{{}}',
    "trace_id" TEXT,
    "branch_id" INTEGER NOT NULL REFERENCES "{BRANCHES_TABLE}" ("id")
);
CREATE INDEX IF NOT EXISTS "idx_turns_branch_id" ON "{TURNS_TABLE}" ("branch_id");
CREATE INDEX IF NOT EXISTS "idx_turns_index" ON "{TURNS_TABLE}" ("index" DESC);"#
    )
}

/// Make sure the root branch exists, using the configured default branch
/// name. Idempotent; a second call changes nothing.
pub async fn ensure_root_branch(db: &Db) -> Result<()> {
    let sql = format!(
        "INSERT INTO \"{BRANCHES_TABLE}\" (\"name\") SELECT $1 WHERE NOT EXISTS (SELECT 1 FROM \"{BRANCHES_TABLE}\")"
    );
    let inserted = db
        .execute(&sql, vec![SqlValue::Text(db.default_branch_name().to_string())])
        .await?;
    if inserted > 0 {
        info!(name = db.default_branch_name(), "created root branch");
    }
    Ok(())
}

impl Branch {
    fn from_row(row: &PgRow) -> Result<Self> {
        let decode = |e: sqlx::Error| Error::decode(BRANCHES_TABLE, e.to_string());
        Ok(Self {
            id: row.try_get("id").map_err(decode)?,
            name: row.try_get("name").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
            updated_at: row.try_get("updated_at").map_err(decode)?,
            forked_from_index: row.try_get("forked_from_index").map_err(decode)?,
            forked_from_branch_id: row.try_get("forked_from_branch_id").map_err(decode)?,
            current_index: row.try_get("current_index").map_err(decode)?,
        })
    }

    pub async fn get(db: &Db, id: i32) -> Result<Branch> {
        Self::get_or_none(db, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("branch {id}")))
    }

    pub async fn get_or_none(db: &Db, id: i32) -> Result<Option<Branch>> {
        let sql = format!("SELECT * FROM \"{BRANCHES_TABLE}\" WHERE \"id\" = $1");
        let row = db.fetch_optional(&sql, vec![SqlValue::Int(id as i64)]).await?;
        row.as_ref().map(Branch::from_row).transpose()
    }

    pub async fn list(db: &Db, limit: i64, offset: i64) -> Result<Vec<Branch>> {
        let sql = format!(
            "SELECT * FROM \"{BRANCHES_TABLE}\" ORDER BY \"created_at\" DESC LIMIT $1 OFFSET $2"
        );
        let rows = db
            .fetch_all(&sql, vec![SqlValue::Int(limit), SqlValue::Int(offset)])
            .await?;
        rows.iter().map(Branch::from_row).collect()
    }

    /// Fork a new branch off this one at `index`. The new branch's turns
    /// start at `index + 1`; at read time it sees the parent's committed
    /// turns up to and including `index`.
    pub async fn fork(&self, db: &Db, index: i32, name: Option<&str>) -> Result<Branch> {
        let probe = format!(
            "SELECT 1 AS one FROM \"{TURNS_TABLE}\" WHERE \"branch_id\" = $1 AND \"index\" = $2 LIMIT 1"
        );
        let exists = db
            .fetch_optional(
                &probe,
                vec![SqlValue::Int(self.id as i64), SqlValue::Int(index as i64)],
            )
            .await?
            .is_some();
        if !exists {
            return Err(Error::versioning(format!(
                "cannot fork branch {}: no turn at index {index}",
                self.id
            )));
        }

        let sql = format!(
            "INSERT INTO \"{BRANCHES_TABLE}\" (\"name\", \"forked_from_index\", \"forked_from_branch_id\", \"current_index\") \
             VALUES ($1, $2, $3, $4) RETURNING *"
        );
        let row = db
            .fetch_one(
                &sql,
                vec![
                    name.map(|n| SqlValue::Text(n.to_string()))
                        .unwrap_or(SqlValue::Null),
                    SqlValue::Int(index as i64),
                    SqlValue::Int(self.id as i64),
                    SqlValue::Int((index + 1) as i64),
                ],
            )
            .await?;
        let branch = Branch::from_row(&row)?;
        info!(parent = self.id, child = branch.id, index, "forked branch");
        Ok(branch)
    }

    /// Fork at the index of an existing turn of this branch.
    pub async fn fork_from_turn(&self, db: &Db, turn: &Turn, name: Option<&str>) -> Result<Branch> {
        if turn.branch_id != self.id {
            return Err(Error::versioning(format!(
                "turn {} belongs to branch {}, not {}",
                turn.id, turn.branch_id, self.id
            )));
        }
        self.fork(db, turn.index, name).await
    }

    /// Open a new staged turn on this branch. The branch head increment
    /// and the turn insert run as one statement inside a transaction, so
    /// concurrent callers get distinct, consecutive indexes.
    pub async fn add_turn(&self, db: &Db) -> Result<Turn> {
        self.add_turn_with(db, None, JsonValue::Object(Default::default()))
            .await
    }

    pub async fn add_turn_with(
        &self,
        db: &Db,
        message: Option<&str>,
        metadata: JsonValue,
    ) -> Result<Turn> {
        let sql = format!(
            "WITH updated_branch AS (\
                 UPDATE \"{BRANCHES_TABLE}\" SET \"current_index\" = \"current_index\" + 1, \"updated_at\" = NOW() \
                 WHERE \"id\" = $1 RETURNING \"id\", \"current_index\"\
             ) \
             INSERT INTO \"{TURNS_TABLE}\" (\"branch_id\", \"index\", \"status\", \"message\", \"metadata\") \
             SELECT \"id\", \"current_index\", $2, $3, $4::JSONB FROM updated_branch \
             RETURNING *"
        );
        let params = vec![
            SqlValue::Int(self.id as i64),
            SqlValue::Text(TurnStatus::Staged.as_str().to_string()),
            message
                .map(|m| SqlValue::Text(m.to_string()))
                .unwrap_or(SqlValue::Null),
            SqlValue::Json(metadata),
        ];

        let mut tx = db.begin().await?;
        let row = tx.fetch_one(&sql, params).await?;
        let turn = Turn::from_row(&row)?;
        tx.commit().await?;
        debug!(branch = self.id, turn = turn.id, index = turn.index, "opened turn");
        Ok(turn)
    }

    /// This branch's turns in index order, each with the branches forked
    /// from it aggregated alongside.
    pub async fn turns(&self, db: &Db, limit: i64, offset: i64) -> Result<Vec<TurnWithForks>> {
        let sql = format!(
            "SELECT t.*, \
                    COALESCE(\
                        json_agg(\
                            jsonb_build_object(\
                                'id', b.id, \
                                'name', b.name, \
                                'forked_from_index', b.forked_from_index, \
                                'forked_from_branch_id', b.forked_from_branch_id\
                            ) ORDER BY b.created_at\
                        ) FILTER (WHERE b.id IS NOT NULL), \
                        '[]'\
                    ) AS forked_branches \
             FROM \"{TURNS_TABLE}\" t \
             LEFT JOIN \"{BRANCHES_TABLE}\" b \
                    ON b.forked_from_branch_id = t.branch_id AND b.forked_from_index = t.index \
             WHERE t.branch_id = $1 \
             GROUP BY t.id \
             ORDER BY t.index ASC \
             LIMIT $2 OFFSET $3"
        );
        let rows = db
            .fetch_all(
                &sql,
                vec![
                    SqlValue::Int(self.id as i64),
                    SqlValue::Int(limit),
                    SqlValue::Int(offset),
                ],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let turn = Turn::from_row(row)?;
                let forks: JsonValue = row
                    .try_get("forked_branches")
                    .map_err(|e| Error::decode("forked_branches", e.to_string()))?;
                let forked_branches = serde_json::from_value(forks)
                    .map_err(|e| Error::decode("forked_branches", e.to_string()))?;
                Ok(TurnWithForks {
                    turn,
                    forked_branches,
                })
            })
            .collect()
    }

    /// Open a turn, run `f` inside a context scoped to it, then commit on
    /// success or revert on error.
    pub async fn in_turn<F, Fut, T>(&self, db: &Db, f: F) -> Result<T>
    where
        F: FnOnce(Turn) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let turn = self.add_turn(db).await?;
        let ctx = context::Context::current_or_default()
            .with_branch(self.id)
            .with_turn(turn.id);
        let result = ctx.scope(f(turn.clone())).await;

        let mut turn = turn;
        match result {
            Ok(value) => {
                turn.commit(db, None).await?;
                Ok(value)
            }
            Err(err) => {
                turn.revert(db, None).await?;
                Err(err)
            }
        }
    }
}

impl Turn {
    fn from_row(row: &PgRow) -> Result<Self> {
        let decode = |e: sqlx::Error| Error::decode(TURNS_TABLE, e.to_string());
        let status: String = row.try_get("status").map_err(decode)?;
        let metadata: Option<JsonValue> = row.try_get("metadata").map_err(decode)?;
        Ok(Self {
            id: row.try_get("id").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
            ended_at: row.try_get("ended_at").map_err(decode)?,
            index: row.try_get("index").map_err(decode)?,
            status: TurnStatus::parse(&status)?,
            message: row.try_get("message").map_err(decode)?,
            metadata: metadata.unwrap_or(JsonValue::Object(Default::default())),
            trace_id: row.try_get("trace_id").map_err(decode)?,
            branch_id: row.try_get("branch_id").map_err(decode)?,
        })
    }

    pub async fn get(db: &Db, id: i32) -> Result<Turn> {
        let sql = format!("SELECT * FROM \"{TURNS_TABLE}\" WHERE \"id\" = $1");
        let row = db
            .fetch_optional(&sql, vec![SqlValue::Int(id as i64)])
            .await?
            .ok_or_else(|| Error::NotFound(format!("turn {id}")))?;
        Turn::from_row(&row)
    }

    pub async fn list(db: &Db, limit: i64, offset: i64) -> Result<Vec<Turn>> {
        let sql = format!(
            "SELECT * FROM \"{TURNS_TABLE}\" ORDER BY \"created_at\" DESC LIMIT $1 OFFSET $2"
        );
        let rows = db
            .fetch_all(&sql, vec![SqlValue::Int(limit), SqlValue::Int(offset)])
            .await?;
        rows.iter().map(Turn::from_row).collect()
    }

    pub async fn commit(&mut self, db: &Db, message: Option<&str>) -> Result<()> {
        self.finish(db, TurnStatus::Committed, message).await
    }

    /// Mark the turn reverted. Its writes stay in the tables but read
    /// queries filter them out.
    pub async fn revert(&mut self, db: &Db, message: Option<&str>) -> Result<()> {
        self.finish(db, TurnStatus::Reverted, message).await
    }

    async fn finish(&mut self, db: &Db, status: TurnStatus, message: Option<&str>) -> Result<()> {
        if self.status != TurnStatus::Staged {
            return Err(Error::versioning(format!(
                "turn {} is {}, not staged",
                self.id,
                self.status.as_str()
            )));
        }
        let sql = format!(
            "UPDATE \"{TURNS_TABLE}\" SET \"status\" = $1, \"ended_at\" = NOW(), \"message\" = COALESCE($2, \"message\") \
             WHERE \"id\" = $3 AND \"status\" = $4 RETURNING *"
        );
        let row = db
            .fetch_optional(
                &sql,
                vec![
                    SqlValue::Text(status.as_str().to_string()),
                    message
                        .map(|m| SqlValue::Text(m.to_string()))
                        .unwrap_or(SqlValue::Null),
                    SqlValue::Int(self.id as i64),
                    SqlValue::Text(TurnStatus::Staged.as_str().to_string()),
                ],
            )
            .await?
            .ok_or_else(|| {
                Error::versioning(format!("turn {} is no longer staged", self.id))
            })?;
        *self = Turn::from_row(&row)?;
        debug!(turn = self.id, status = status.as_str(), "finished turn");
        Ok(())
    }
}

/// The recursive hierarchy body: the branch itself seeds the walk —
/// with its current head index, or with `head_index` when the read is
/// pinned to an earlier turn — and each parent contributes its turns up
/// to the child's fork point. The branch id is inlined — it is a trusted
/// integer.
pub fn branch_hierarchy_body(branch_id: i32, head_index: Option<i32>) -> String {
    let seed_start = match head_index {
        Some(index) => index.to_string(),
        None => "current_index".to_string(),
    };
    format!(
        "SELECT id, forked_from_index, forked_from_branch_id, {seed_start} AS start_turn_index \
         FROM {BRANCHES_TABLE} WHERE id = {branch_id} \
         UNION ALL \
         SELECT b.id, b.forked_from_index, b.forked_from_branch_id, bh.forked_from_index AS start_turn_index \
         FROM {BRANCHES_TABLE} b \
         JOIN branch_hierarchy bh ON b.id = bh.forked_from_branch_id"
    )
}

/// SELECT of the turn ids visible at `branch_id` — optionally as of
/// `head_index` rather than the branch head: turns of each branch in the
/// hierarchy whose index is within that branch's window and whose status
/// matches (committed, by default).
pub fn visible_turns_query(
    branch_id: i32,
    head_index: Option<i32>,
    status: TurnStatus,
    limit: Option<i64>,
) -> SelectQuery {
    let mut query = SelectQuery::from_table(TableRef::aliased(TURNS_TABLE, "t"));
    query.prepend_cte(
        "branch_hierarchy",
        CteBody::Raw(branch_hierarchy_body(branch_id, head_index)),
        true,
    );
    query.columns = vec![Expr::qual_col("t", "id")];
    query.add_join(
        FromItem::Table(TableRef::aliased("branch_hierarchy", "bh")),
        Expr::eq(Expr::qual_col("t", "branch_id"), Expr::qual_col("bh", "id")),
        JoinKind::Inner,
    );
    query.add_where(
        Expr::eq(
            Expr::qual_col("t", "status"),
            Expr::param(status.as_str()),
        )
        .and(Expr::lte(
            Expr::qual_col("t", "index"),
            Expr::qual_col("bh", "start_turn_index"),
        )),
    );
    query.order_by = vec![OrderBy::desc(Expr::qual_col("t", "index"))];
    query.limit = limit;
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Compiler;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_parse_round_trips() {
        for status in [TurnStatus::Staged, TurnStatus::Committed, TurnStatus::Reverted] {
            assert_eq!(TurnStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TurnStatus::parse("zombie").is_err());
    }

    #[test]
    fn ddl_contains_required_columns() {
        let ddl = versioning_ddl();
        assert!(ddl.contains("\"forked_from_branch_id\" INTEGER REFERENCES \"branches\" (\"id\")"));
        assert!(ddl.contains("\"index\" INTEGER NOT NULL"));
        assert!(ddl.contains("idx_turns_index"));
    }

    #[test]
    fn hierarchy_body_walks_parents() {
        let body = branch_hierarchy_body(3, None);
        assert!(body.contains("WHERE id = 3"));
        assert!(body.contains("current_index AS start_turn_index"));
        assert!(body.contains("UNION ALL"));
        assert!(body.contains("bh.forked_from_index AS start_turn_index"));
    }

    #[test]
    fn pinned_hierarchy_seeds_with_the_given_index() {
        let body = branch_hierarchy_body(3, Some(2));
        assert!(body.contains("SELECT id, forked_from_index, forked_from_branch_id, 2 AS start_turn_index"));
    }

    #[test]
    fn visible_turns_query_shape() {
        let compiled = Compiler::new()
            .compile(&visible_turns_query(2, None, TurnStatus::Committed, None))
            .unwrap();
        assert_eq!(
            compiled.sql,
            "WITH RECURSIVE branch_hierarchy AS (\
                 SELECT id, forked_from_index, forked_from_branch_id, current_index AS start_turn_index \
                 FROM branches WHERE id = 2 \
                 UNION ALL \
                 SELECT b.id, b.forked_from_index, b.forked_from_branch_id, bh.forked_from_index AS start_turn_index \
                 FROM branches b \
                 JOIN branch_hierarchy bh ON b.id = bh.forked_from_branch_id\
             ) \
             SELECT t.id FROM turns AS t \
             INNER JOIN branch_hierarchy AS bh ON (t.branch_id = bh.id) \
             WHERE ((t.status = $1) AND (t.index <= bh.start_turn_index)) \
             ORDER BY t.index DESC"
        );
        assert_eq!(
            compiled.params,
            vec![SqlValue::Text("committed".to_string())]
        );
    }
}
