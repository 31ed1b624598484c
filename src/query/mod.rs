//! Query plans
//!
//! One plan builder per actor mode. Every plan selects the actor UUID as its
//! first column, ordered by the store, and pages with bound `LIMIT`/`OFFSET`.

pub mod builder;
pub mod funnel;
pub mod lifecycle;
pub mod path;
pub mod person;
pub mod predicate;
pub mod property_values;
pub mod retention;
pub mod stickiness;

pub use builder::{QueryBuilder, QueryPlan, SqlParam};

use crate::error::Result;
use crate::filter::{Entity, Filter};
use predicate::{compile_predicates, PropertyColumns};

/// Property columns in scope inside [`EventSource`] queries.
pub const EVENT_COLUMNS: PropertyColumns<'static> = PropertyColumns {
    person: "person.person_props",
    event: Some("e.properties"),
};

/// Current alias → person mapping.
pub fn person_distinct_ids(team: &str) -> String {
    format!(
        "SELECT distinct_id, argMax(person_id, version) AS person_id \
         FROM person_distinct_id2 WHERE team_id = {} \
         GROUP BY distinct_id HAVING argMax(is_deleted, version) = 0",
        team
    )
}

/// Latest version of every live person.
pub fn live_persons(team: &str) -> String {
    format!(
        "SELECT id, argMax(properties, version) AS person_props, argMax(created_at, version) AS created_at \
         FROM person WHERE team_id = {} \
         GROUP BY id HAVING max(is_deleted) = 0",
        team
    )
}

/// Events of a team joined to the persons they belong to.
pub struct EventSource {
    pub from: String,
    pub conditions: Vec<String>,
}

impl EventSource {
    /// Events in the filter's date range matching its global predicates.
    pub fn for_filter(filter: &Filter, b: &mut QueryBuilder) -> Result<Self> {
        let mut source = Self::unbounded(filter, b)?;
        if let Some(from) = filter.date_range().from() {
            let from = b.bind(from);
            source.conditions.push(format!("e.timestamp >= {}", from));
        }
        let to = b.bind(filter.date_range().to());
        source.conditions.push(format!("e.timestamp <= {}", to));
        Ok(source)
    }

    /// Events matching the global predicates regardless of time.
    pub fn unbounded(filter: &Filter, b: &mut QueryBuilder) -> Result<Self> {
        let team = b.bind(filter.team_id());
        let from = format!(
            "events AS e\n\
             INNER JOIN ({}) AS pdi ON e.distinct_id = pdi.distinct_id\n\
             INNER JOIN ({}) AS person ON person.id = pdi.person_id",
            person_distinct_ids(&team),
            live_persons(&team)
        );
        let mut conditions = vec![format!("e.team_id = {}", team)];
        conditions.extend(compile_predicates(filter.properties(), EVENT_COLUMNS, b)?);
        Ok(Self { from, conditions })
    }

    pub fn push(&mut self, condition: String) {
        self.conditions.push(condition);
    }

    pub fn where_clause(&self) -> String {
        predicate::and_all(&self.conditions)
    }
}

/// `e.event = <name>` plus the entity's own predicates.
pub fn entity_condition(entity: &Entity, b: &mut QueryBuilder) -> Result<String> {
    let event = b.bind(entity.event_name()?);
    let mut parts = vec![format!("e.event = {}", event)];
    parts.extend(compile_predicates(&entity.properties, EVENT_COLUMNS, b)?);
    Ok(format!("({})", parts.join(" AND ")))
}
