//! Item store operations: conditional writes, prefix queries and transact-write.

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::{Map, Value};

use super::{Condition, Database, DbError, DbResult, Item, ItemKey, Mutation, WriteOp};

/// Attribute projected into the cohort index column.
pub(crate) const COHORT_ATTR: &str = "cohort_key";

/// Sort order for prefix queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Ordered range query over a sort-key prefix within one partition.
#[derive(Debug, Clone)]
pub struct Query {
    pub pk: String,
    pub sk_prefix: String,
    pub order: SortOrder,
    pub limit: usize,
    pub cursor: Option<String>,
}

impl Query {
    pub fn new(pk: impl Into<String>, sk_prefix: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk_prefix: sk_prefix.into(),
            order: SortOrder::Ascending,
            limit: 100,
            cursor: None,
        }
    }

    pub fn descending(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }
}

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Item>,
    /// Opaque cursor for the next page, absent on the last page.
    pub next_cursor: Option<String>,
}

impl Database {
    /// Get an item by key.
    pub fn get_item(&self, key: &ItemKey) -> DbResult<Option<Item>> {
        let attrs = load_attrs(&self.conn, key)?;
        Ok(attrs.map(|attrs| Item {
            key: key.clone(),
            attrs,
        }))
    }

    /// Write a whole item, optionally conditioned on its current image.
    pub fn put_item(&self, item: &Item, condition: Option<Condition>) -> DbResult<()> {
        self.transact_write(vec![WriteOp::Put {
            item: item.clone(),
            condition,
        }])
    }

    /// Apply mutations to an item, creating it if absent. Returns the new image.
    pub fn update_item(
        &self,
        key: &ItemKey,
        mutations: &[Mutation],
        condition: Option<Condition>,
    ) -> DbResult<Item> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let attrs = apply_update(&tx, 0, key, mutations, condition.as_ref())?;
        tx.commit()?;
        Ok(Item {
            key: key.clone(),
            attrs,
        })
    }

    /// Delete an item. Returns whether a row was removed.
    pub fn delete_item(&self, key: &ItemKey, condition: Option<Condition>) -> DbResult<bool> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let removed = apply_delete(&tx, 0, key, condition.as_ref())?;
        tx.commit()?;
        Ok(removed)
    }

    /// Apply every write or none of them.
    ///
    /// Preconditions are checked against the image left by earlier writes in the
    /// same batch. The first failing precondition aborts the whole batch with
    /// [`DbError::ConditionFailed`].
    pub fn transact_write(&self, ops: Vec<WriteOp>) -> DbResult<()> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        for (index, op) in ops.iter().enumerate() {
            match op {
                WriteOp::Put { item, condition } => {
                    apply_put(&tx, index, item, condition.as_ref())?;
                }
                WriteOp::Update {
                    key,
                    mutations,
                    condition,
                } => {
                    apply_update(&tx, index, key, mutations, condition.as_ref())?;
                }
                WriteOp::Delete { key, condition } => {
                    apply_delete(&tx, index, key, condition.as_ref())?;
                }
                WriteOp::Check { key, condition } => {
                    let current = load_attrs(&tx, key)?;
                    check(index, key, Some(condition), current.as_ref())?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Ordered query over a sort-key prefix within one partition.
    pub fn query_items(&self, query: &Query) -> DbResult<Page> {
        let after = query.cursor.as_deref().map(decode_cursor).transpose()?;
        let sql = match query.order {
            SortOrder::Ascending => {
                r#"
                SELECT sk, body FROM items
                WHERE pk = ?1
                  AND substr(sk, 1, length(?2)) = ?2
                  AND (?3 IS NULL OR sk > ?3)
                ORDER BY sk ASC
                LIMIT ?4
                "#
            }
            SortOrder::Descending => {
                r#"
                SELECT sk, body FROM items
                WHERE pk = ?1
                  AND substr(sk, 1, length(?2)) = ?2
                  AND (?3 IS NULL OR sk < ?3)
                ORDER BY sk DESC
                LIMIT ?4
                "#
            }
        };

        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(
            params![query.pk, query.sk_prefix, after, fetch_limit(query.limit)],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;

        let mut items = Vec::new();
        for row in rows {
            let (sk, body) = row?;
            items.push(Item {
                key: ItemKey::new(query.pk.clone(), sk),
                attrs: parse_body(&body)?,
            });
        }

        Ok(paginate(items, query.limit, |item| item.key.sk.clone()))
    }

    /// Query the cohort index, ordered by partition key.
    pub fn query_cohort(
        &self,
        cohort_key: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> DbResult<Page> {
        let after = cursor.map(decode_cursor).transpose()?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT pk, sk, body FROM items
            WHERE cohort_key = ?1
              AND (?2 IS NULL OR pk > ?2)
            ORDER BY pk ASC
            LIMIT ?3
            "#,
        )?;

        let rows = stmt.query_map(params![cohort_key, after, fetch_limit(limit)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (pk, sk, body) = row?;
            items.push(Item {
                key: ItemKey::new(pk, sk),
                attrs: parse_body(&body)?,
            });
        }

        Ok(paginate(items, limit, |item| item.key.pk.clone()))
    }
}

fn load_attrs(conn: &Connection, key: &ItemKey) -> DbResult<Option<Map<String, Value>>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM items WHERE pk = ?1 AND sk = ?2",
            params![key.pk, key.sk],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| parse_body(&b)).transpose()
}

fn store_attrs(conn: &Connection, key: &ItemKey, attrs: &Map<String, Value>) -> DbResult<()> {
    let body = serde_json::to_string(attrs)?;
    let cohort = attrs.get(COHORT_ATTR).and_then(Value::as_str);
    conn.execute(
        r#"
        INSERT INTO items (pk, sk, body, cohort_key) VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (pk, sk) DO UPDATE SET body = excluded.body, cohort_key = excluded.cohort_key
        "#,
        params![key.pk, key.sk, body, cohort],
    )?;
    Ok(())
}

fn check(
    index: usize,
    key: &ItemKey,
    condition: Option<&Condition>,
    current: Option<&Map<String, Value>>,
) -> DbResult<()> {
    match condition {
        Some(cond) if !cond.holds(current) => Err(DbError::ConditionFailed {
            index,
            key: key.to_string(),
        }),
        _ => Ok(()),
    }
}

fn apply_put(
    conn: &Connection,
    index: usize,
    item: &Item,
    condition: Option<&Condition>,
) -> DbResult<()> {
    if condition.is_some() {
        let current = load_attrs(conn, &item.key)?;
        check(index, &item.key, condition, current.as_ref())?;
    }
    store_attrs(conn, &item.key, &item.attrs)
}

fn apply_update(
    conn: &Connection,
    index: usize,
    key: &ItemKey,
    mutations: &[Mutation],
    condition: Option<&Condition>,
) -> DbResult<Map<String, Value>> {
    let current = load_attrs(conn, key)?;
    check(index, key, condition, current.as_ref())?;

    let mut attrs = current.unwrap_or_default();
    for mutation in mutations {
        mutation.apply(&mut attrs)?;
    }
    store_attrs(conn, key, &attrs)?;
    Ok(attrs)
}

fn apply_delete(
    conn: &Connection,
    index: usize,
    key: &ItemKey,
    condition: Option<&Condition>,
) -> DbResult<bool> {
    if condition.is_some() {
        let current = load_attrs(conn, key)?;
        check(index, key, condition, current.as_ref())?;
    }
    let removed = conn.execute(
        "DELETE FROM items WHERE pk = ?1 AND sk = ?2",
        params![key.pk, key.sk],
    )?;
    Ok(removed > 0)
}

fn parse_body(body: &str) -> DbResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(body)? {
        Value::Object(map) => Ok(map),
        _ => Err(DbError::Constraint("item body is not an object".into())),
    }
}

/// Row limit for a page of `limit`: one extra row signals a next page.
fn fetch_limit(limit: usize) -> i64 {
    i64::try_from(limit).map_or(i64::MAX, |n| n.saturating_add(1))
}

fn paginate(mut items: Vec<Item>, limit: usize, position: impl Fn(&Item) -> String) -> Page {
    let next_cursor = if items.len() > limit {
        items.truncate(limit);
        items.last().map(|item| encode_cursor(&position(item)))
    } else {
        None
    };
    Page { items, next_cursor }
}

/// Cursor that resumes a query just past `position` (a sort key, or a
/// partition key for cohort queries).
pub fn cursor_after(position: &str) -> String {
    encode_cursor(position)
}

fn encode_cursor(position: &str) -> String {
    hex::encode(position.as_bytes())
}

fn decode_cursor(cursor: &str) -> DbResult<String> {
    let bytes = hex::decode(cursor).map_err(|e| DbError::InvalidCursor(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| DbError::InvalidCursor(e.to_string()))
}
