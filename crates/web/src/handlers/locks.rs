use std::{sync::Arc, time::Instant};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use maud::{DOCTYPE, PreEscaped, html};
use serde::Deserialize;
use terrapin_core::{AppError, config::Config, util::lock_url};
use terrapin_events::locking::LockingClient;

use crate::handlers::common::{date, footer, header, nav, timeago};

#[derive(Deserialize)]
pub struct LockQuery {
    id: String,
}

pub async fn get_index(
    State(locker): State<LockingClient>,
    State(config): State<Arc<Config>>,
) -> Result<Response, AppError> {
    let start = Instant::now();
    let locks = locker.list().await?;
    let rendered = html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                title { "Locks • terrapin" }
                (header())
            }
            body {
                (nav())
                main {
                    h3 { "Locks" }
                    @if locks.is_empty() {
                        p { "No locks found." }
                    } @else {
                        table {
                            thead {
                                tr {
                                    th { "Repository" }
                                    th { "Path" }
                                    th { "Workspace" }
                                    th { "Pull request" }
                                    th { "Locked" }
                                }
                            }
                            tbody {
                                @for (id, lock) in &locks {
                                    tr {
                                        td { (lock.project.repo_full_name) }
                                        td {
                                            a href=(lock_url(&config.server.url, id).as_str()) {
                                                (lock.project.path)
                                            }
                                        }
                                        td { (lock.workspace) }
                                        td {
                                            a href=(lock.pull.url) { "#" (lock.pull.num) }
                                            " by " (lock.user.username)
                                        }
                                        td title=(date(lock.created_at)) { (timeago(lock.created_at)) }
                                    }
                                }
                            }
                        }
                    }
                }
                (footer(start))
            }
        }
    };
    Ok(rendered.into_response())
}

pub async fn get_lock(
    State(locker): State<LockingClient>,
    Query(LockQuery { id }): Query<LockQuery>,
) -> Result<Response, AppError> {
    let start = Instant::now();
    let Some(lock) = locker.get_lock(&id).await? else {
        return Ok((StatusCode::NOT_FOUND, "No lock found at that id").into_response());
    };
    let discard_script = format!(
        "document.getElementById('discard').addEventListener('click',()=>{{\
         if(!confirm('Discard this lock and its plan?'))return;\
         fetch('/locks?id='+encodeURIComponent({}),{{method:'DELETE'}})\
         .then(r=>{{if(r.ok)location.href='/';else r.text().then(alert);}});}});",
        // Keep `</script>` in an id from closing the tag
        serde_json::to_string(&id)?.replace('<', "\\u003c")
    );
    let rendered = html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                title { (lock.project.path) " • terrapin" }
                (header())
            }
            body {
                (nav())
                main {
                    h3 { "Lock " code { (id) } }
                    table {
                        tbody {
                            tr { th { "Repository" } td { (lock.project.repo_full_name) } }
                            tr { th { "Path" } td { (lock.project.path) } }
                            tr { th { "Workspace" } td { (lock.workspace) } }
                            tr {
                                th { "Pull request" }
                                td { a href=(lock.pull.url) { "#" (lock.pull.num) } }
                            }
                            tr { th { "Author" } td { (lock.pull.author) } }
                            tr { th { "Locked by" } td { (lock.user.username) } }
                            tr {
                                th { "Locked" }
                                td { (date(lock.created_at)) " (" (timeago(lock.created_at)) ")" }
                            }
                        }
                    }
                    p class="muted" {
                        "Discarding the lock deletes the plan. The pull request must plan again before applying."
                    }
                    button #discard type="button" { "Discard lock" }
                    script { (PreEscaped(discard_script)) }
                }
                (footer(start))
            }
        }
    };
    Ok(rendered.into_response())
}

pub async fn delete_lock(
    State(locker): State<LockingClient>,
    Query(LockQuery { id }): Query<LockQuery>,
) -> Result<Response, AppError> {
    if id.is_empty() {
        return Ok((StatusCode::BAD_REQUEST, "No lock id in request").into_response());
    }
    match locker.unlock(&id).await? {
        Some(lock) => {
            tracing::info!(pull = lock.pull.num, "Deleted lock id {id}");
            Ok((StatusCode::OK, format!("Deleted lock id {id}")).into_response())
        }
        None => {
            tracing::warn!("No lock found at id {id}");
            Ok((StatusCode::NOT_FOUND, "No lock found at that id").into_response())
        }
    }
}
