//! Ticket management commands: TOML import, listing, approval,
//! cancellation, reviewer verdicts, and operator retry.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use sqlx::PgPool;

use drover_core::state::dispatch;
use drover_db::models::{TicketStatus, is_ticket_id, new_ticket_id};
use drover_db::queries::tickets::{self, NewTicket, TicketFilter};

use crate::TicketCommands;

/// Actor id recorded on operator-initiated events.
const OPERATOR: &str = "operator";

// -----------------------------------------------------------------------
// TOML ticket definition format
// -----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TicketDoc {
    pub project: String,
    pub repo_url: String,
    #[serde(default)]
    pub epic: Option<String>,
    pub tickets: Vec<TicketDef>,
}

#[derive(Debug, Deserialize)]
pub struct TicketDef {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub files_to_create: Vec<String>,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default)]
    pub model: Option<String>,
    /// Titles of other tickets in this document that must finish first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub criteria: Vec<CriterionDef>,
}

#[derive(Debug, Deserialize)]
pub struct CriterionDef {
    pub id: String,
    pub description: String,
}

fn default_scope() -> String {
    "medium".to_owned()
}

fn default_max_attempts() -> i32 {
    3
}

/// Parse a ticket definition document, checking intra-file consistency.
pub fn parse_ticket_doc(contents: &str) -> Result<TicketDoc> {
    let doc: TicketDoc = toml::from_str(contents).context("failed to parse ticket TOML")?;

    if doc.tickets.is_empty() {
        bail!("ticket document defines no tickets");
    }

    let mut titles = std::collections::HashSet::new();
    for ticket in &doc.tickets {
        if !titles.insert(ticket.title.as_str()) {
            bail!("duplicate ticket title {:?}", ticket.title);
        }
        if !matches!(ticket.scope.as_str(), "small" | "medium" | "large") {
            bail!(
                "ticket {:?} has invalid scope {:?} (small|medium|large)",
                ticket.title,
                ticket.scope
            );
        }
    }
    for ticket in &doc.tickets {
        for dep in &ticket.depends_on {
            if !titles.contains(dep.as_str()) {
                bail!(
                    "ticket {:?} depends on unknown title {:?}",
                    ticket.title,
                    dep
                );
            }
        }
    }

    Ok(doc)
}

/// Insert all tickets from a document, wiring dependency edges by title.
/// Returns `(title, id)` pairs in document order.
pub async fn import_ticket_doc(pool: &PgPool, doc: &TicketDoc) -> Result<Vec<(String, String)>> {
    let mut ids: HashMap<String, String> = HashMap::new();
    let mut inserted = Vec::new();

    for def in &doc.tickets {
        let id = new_ticket_id();
        let criteria: Vec<serde_json::Value> = def
            .criteria
            .iter()
            .map(|c| serde_json::json!({"id": c.id, "description": c.description}))
            .collect();

        let new = NewTicket {
            id: id.clone(),
            project: doc.project.clone(),
            title: def.title.clone(),
            description: def.description.clone(),
            acceptance_criteria: serde_json::Value::Array(criteria),
            estimated_scope: def.scope.clone(),
            repo_url: doc.repo_url.clone(),
            branch_name: def
                .branch
                .clone()
                .unwrap_or_else(|| format!("drover/{id}")),
            epic: doc.epic.clone(),
            model_override: def.model.clone(),
            files_to_create: def.files_to_create.clone(),
            files_to_modify: def.files_to_modify.clone(),
            max_attempts: def.max_attempts,
        };
        tickets::insert_ticket(pool, &new).await?;
        ids.insert(def.title.clone(), id.clone());
        inserted.push((def.title.clone(), id));
    }

    // Edges after all inserts so forward references work.
    for def in &doc.tickets {
        let ticket_id = &ids[&def.title];
        for dep_title in &def.depends_on {
            let dep_id = &ids[dep_title];
            tickets::insert_dependency(pool, ticket_id, dep_id).await?;
        }
    }

    Ok(inserted)
}

// -----------------------------------------------------------------------
// Command dispatch
// -----------------------------------------------------------------------

pub async fn run_ticket_command(command: TicketCommands, pool: &PgPool) -> Result<()> {
    match command {
        TicketCommands::Create { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {file}"))?;
            let doc = parse_ticket_doc(&contents)?;
            let inserted = import_ticket_doc(pool, &doc).await?;
            println!("Imported {} tickets into project {}:", inserted.len(), doc.project);
            for (title, id) in &inserted {
                println!("  {id}  {title}");
            }
            println!("\nNext: `drover ticket approve <id>` to make them claimable.");
        }
        TicketCommands::Show { ticket_id } => {
            let ticket = tickets::get_ticket(pool, &ticket_id)
                .await?
                .with_context(|| format!("ticket {ticket_id} not found"))?;
            println!("{}  {}", ticket.id, ticket.title);
            println!("  project:  {}", ticket.project);
            println!("  status:   {}", ticket.status);
            println!("  scope:    {}", ticket.estimated_scope);
            println!("  attempts: {}/{}", ticket.attempts, ticket.max_attempts);
            println!("  branch:   {}", ticket.branch_name);
            if let Some(assignee) = &ticket.assignee_id {
                println!("  assignee: {assignee}");
            }
            if let Some(pr_url) = &ticket.pr_url {
                println!("  pr:       {pr_url}");
            }
            if let Some(class) = &ticket.last_error_class {
                println!("  last error: {class}");
            }
            let deps = tickets::dependencies_of(pool, &ticket_id).await?;
            if !deps.is_empty() {
                println!("  depends on: {}", deps.join(", "));
            }
            println!("  criteria:");
            for criterion in &ticket.acceptance_criteria.0 {
                println!("    {}: {}", criterion.id, criterion.description);
            }
        }
        TicketCommands::List { project, status } => {
            let status = match status {
                Some(s) => Some(
                    s.parse::<TicketStatus>()
                        .map_err(|e| anyhow::anyhow!("{e}"))?,
                ),
                None => None,
            };
            let listed = tickets::list_tickets(
                pool,
                &TicketFilter {
                    project,
                    status,
                    ..Default::default()
                },
            )
            .await?;
            if listed.is_empty() {
                println!("No tickets found.");
            }
            for ticket in &listed {
                println!(
                    "{}  {:12}  {}/{}  {}",
                    ticket.id, ticket.status.to_string(), ticket.attempts, ticket.max_attempts,
                    ticket.title
                );
            }
        }
        TicketCommands::Approve { ticket_id } => {
            dispatch::approve_ticket(pool, &ticket_id, OPERATOR).await?;
            println!("Ticket {ticket_id} approved and ready to claim.");
        }
        TicketCommands::Cancel { ticket_id } => {
            dispatch::cancel_ticket(pool, &ticket_id, OPERATOR).await?;
            println!("Ticket {ticket_id} cancelled.");
        }
        TicketCommands::Retry { ticket_id } => {
            dispatch::operator_retry(pool, &ticket_id, OPERATOR).await?;
            println!("Ticket {ticket_id} reset to ready with a fresh attempt budget.");
        }
        TicketCommands::DepAdd {
            ticket_id,
            depends_on,
        } => {
            for id in [&ticket_id, &depends_on] {
                if !is_ticket_id(id) {
                    bail!("{id:?} is not a ticket id (expected TKT-<8 hex>)");
                }
            }
            tickets::insert_dependency(pool, &ticket_id, &depends_on).await?;
            println!("Dependency recorded: {ticket_id} depends on {depends_on}.");
        }
    }
    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
