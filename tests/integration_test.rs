#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, RwLock};

    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::{Value, json};
    use serial_test::serial;
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    use flywheel::config::AppConfig;
    use flywheel::db::{async_db, initialize_db};
    use flywheel::embedding::{EmbedCache, HashEmbedder};
    use flywheel::pipeline::{IndexState, Pipeline};
    use flywheel::server::{AppState, app};

    struct TestApp {
        app: Router,
        pipeline: Arc<Pipeline>,
        _dir: TempDir,
    }

    fn write_note(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn seed_vault(root: &Path) {
        write_note(
            root,
            "people/Marcus Johnson.md",
            "Works on [[Turbopump]] delivery tracking.\n",
        );
        write_note(
            root,
            "projects/Turbopump.md",
            "Rocket engine delivery project led by [[Marcus Johnson]] with [[Acme Corp]].\n",
        );
        write_note(
            root,
            "organizations/Acme Corp.md",
            "Customer for [[Turbopump]] delivery.\n",
        );
        write_note(root, "daily-notes/2025-06-15.md", "Quiet morning.\n");
        write_note(
            root,
            "tech/CI-CD.md",
            "---\naliases: [CI/CD]\n---\nOur deployment pipeline automation. Continuous integration keeps slow builds honest.\n",
        );
        write_note(
            root,
            "tech/Model Context Protocol.md",
            "---\naliases: [MCP]\n---\nA protocol for tool use.\n",
        );
        write_note(root, "concepts/Machine.md", "A machine in general.\n");
        write_note(
            root,
            "concepts/Machine Learning.md",
            "Statistical learning from data.\n",
        );
    }

    /// Builds a fully indexed app over a seeded temp vault. Uses the
    /// deterministic hash embedder so semantic scoring needs no model
    /// download.
    async fn test_app() -> TestApp {
        let dir = TempDir::new().expect("Failed to create temp vault");
        seed_vault(dir.path());

        let config = AppConfig::for_vault(dir.path().to_path_buf());
        fs::create_dir_all(&config.state_path).expect("Failed to create state dir");
        let db = async_db(&config.db_path())
            .await
            .expect("Failed to connect to async db");
        db.call(|conn| {
            initialize_db(conn).expect("Failed to initialize db");
            Ok(())
        })
        .await
        .unwrap();

        let pipeline = Arc::new(Pipeline {
            config,
            db,
            state: Arc::new(RwLock::new(IndexState::new())),
            embedder: Arc::new(HashEmbedder),
            embed_cache: Arc::new(EmbedCache::default()),
        });
        pipeline.initialize().await.expect("Index build failed");

        let app_state = AppState::new(Arc::clone(&pipeline), Some(Arc::new(HashEmbedder)));
        TestApp {
            app: app(Arc::new(RwLock::new(app_state))),
            pipeline,
            _dir: dir,
        }
    }

    async fn body_to_json(body: Body) -> Value {
        let bytes = axum::body::to_bytes(body, 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn post_json(app: &Router, uri: &str, payload: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        (status, body_to_json(response.into_body()).await)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        (status, body_to_json(response.into_body()).await)
    }

    #[tokio::test]
    #[serial]
    async fn it_reports_ready_status() {
        let harness = test_app().await;
        let (status, body) = get_json(&harness.app, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"]["state"], "ready");
        assert_eq!(body["stale"], false);
        assert!(body["entities"].as_u64().unwrap() >= 7);
    }

    #[tokio::test]
    #[serial]
    async fn it_searches_full_text() {
        let harness = test_app().await;
        let (status, body) =
            get_json(&harness.app, "/notes/search?query=delivery&similarity=false").await;
        assert_eq!(status, StatusCode::OK);
        let results = body["results"].as_array().unwrap();
        assert!(!results.is_empty());
        let paths: Vec<&str> = results.iter().filter_map(|r| r["path"].as_str()).collect();
        assert!(paths.contains(&"projects/Turbopump.md"));
    }

    #[tokio::test]
    #[serial]
    async fn it_serves_backlinks() {
        let harness = test_app().await;
        let (status, body) =
            get_json(&harness.app, "/notes/backlinks?path=projects/Turbopump.md").await;
        assert_eq!(status, StatusCode::OK);
        let sources: Vec<&str> = body["backlinks"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|b| b["source"].as_str())
            .collect();
        assert!(sources.contains(&"people/Marcus Johnson.md"));
        assert!(sources.contains(&"organizations/Acme Corp.md"));
    }

    #[tokio::test]
    #[serial]
    async fn it_rejects_unknown_strictness() {
        let harness = test_app().await;
        let (status, _) = post_json(
            &harness.app,
            "/notes/suggest",
            json!({"content": "anything", "strictness": "reckless"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    // A declared category outside the fixed set is a validation
    // error at the write boundary, never a silent fallback.
    #[tokio::test]
    #[serial]
    async fn it_rejects_unknown_frontmatter_category_on_write() {
        let harness = test_app().await;
        let root = harness.pipeline.config.vault_path.clone();
        write_note(&root, "misc/Gadget.md", "---\ntype: martian\n---\nSome body.\n");
        harness
            .pipeline
            .process_items(
                vec![flywheel::pipeline::BatchItem::Upsert("misc/Gadget.md".to_string())],
                false,
            )
            .await
            .unwrap();

        let (status, body) = post_json(
            &harness.app,
            "/notes/write",
            json!({"path": "misc/Gadget.md", "content": "more text"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let message = body["diagnostic"]["message"].as_str().unwrap();
        assert!(message.contains("martian"));
        assert!(!body["diagnostic"]["suggestions"].as_array().unwrap().is_empty());

        // The note indexed as a note, but never became an entity.
        let state = harness.pipeline.state.read().unwrap();
        assert!(state.vault.as_ref().unwrap().notes.contains_key("misc/Gadget.md"));
        assert!(state.entities.get("Gadget").is_none());
    }

    #[tokio::test]
    #[serial]
    async fn it_rejects_traversal_paths_on_write() {
        let harness = test_app().await;
        let (status, _) = post_json(
            &harness.app,
            "/notes/write",
            json!({"path": "../outside.md", "content": "nope"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // Worked ranking example: three related entities, conservative
    // strictness, all must clear the bar in relevance order with a
    // live semantic contribution on the winner.
    #[tokio::test]
    #[serial]
    async fn it_ranks_the_turbopump_example() {
        let harness = test_app().await;
        let (status, body) = post_json(
            &harness.app,
            "/notes/suggest",
            json!({
                "content": "Turbopump delivery delayed. Marcus tracking with Acme.",
                "path": "daily-notes/2025-06-15.md",
                "strictness": "conservative",
                "max_suggestions": 3,
                "detail": true,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let suggestions = body["suggestions"].as_array().unwrap();
        let names: Vec<&str> = suggestions
            .iter()
            .filter_map(|s| s["name"].as_str())
            .collect();
        assert_eq!(names, vec!["Turbopump", "Marcus Johnson", "Acme Corp"]);

        let scores: Vec<f64> = suggestions
            .iter()
            .filter_map(|s| s["score"].as_f64())
            .collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]), "{:?}", scores);
        assert!(scores.iter().all(|s| *s >= 15.0), "{:?}", scores);

        let turbopump_semantic = suggestions[0]["breakdown"]["semantic"].as_f64().unwrap();
        assert!(turbopump_semantic > 0.0);
    }

    // Backtick-wrapped text is protected; only the bare mention gets
    // linked.
    #[tokio::test]
    #[serial]
    async fn it_respects_code_zones_on_write() {
        let harness = test_app().await;
        let (status, body) = post_json(
            &harness.app,
            "/notes/write",
            json!({
                "path": "daily-notes/2025-06-15.md",
                "content": "See `Marcus Johnson` in the code. Marcus Johnson was here.",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let text = body["text"].as_str().unwrap();
        assert!(text.contains("`Marcus Johnson`"));
        assert!(text.contains("[[Marcus Johnson]] was here"));
        assert_eq!(text.matches("[[Marcus Johnson]]").count(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn it_rewrites_aliases_with_display_form() {
        let harness = test_app().await;
        let (status, body) = post_json(
            &harness.app,
            "/notes/write",
            json!({
                "path": "daily-notes/2025-06-15.md",
                "content": "We use MCP daily.",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let text = body["text"].as_str().unwrap();
        assert!(text.contains("We use [[Model Context Protocol|MCP]] daily."));
    }

    #[tokio::test]
    #[serial]
    async fn it_prefers_the_longest_match() {
        let harness = test_app().await;
        let (status, body) = post_json(
            &harness.app,
            "/notes/write",
            json!({
                "path": "daily-notes/2025-06-15.md",
                "content": "Machine Learning is great.",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let text = body["text"].as_str().unwrap();
        assert!(text.contains("[[Machine Learning]] is great."));
        // The shorter entity may still show up as a suggestion, but
        // never as a competing link inside the sentence.
        let prose = text.split('\u{2192}').next().unwrap();
        assert!(!prose.contains("[[Machine]]"));
    }

    #[tokio::test]
    #[serial]
    async fn it_returns_closest_section_on_miss() {
        let harness = test_app().await;
        write_note(
            harness.pipeline.config.vault_path.as_path(),
            "projects/Plan.md",
            "# Overview\ntext\n# Action Items\nmore\n",
        );
        harness
            .pipeline
            .process_items(
                vec![flywheel::pipeline::BatchItem::Upsert("projects/Plan.md".to_string())],
                false,
            )
            .await
            .unwrap();

        let (status, body) = post_json(
            &harness.app,
            "/notes/write",
            json!({
                "path": "projects/Plan.md",
                "section": "Action Itmes",
                "content": "new entry",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["diagnostic"]["closest_section"], "Action Items");
    }

    // Repeated engine-applied links that users strip out accumulate
    // negative feedback until the entity is suppressed in that
    // folder (global suppression needs a larger sample).
    #[tokio::test]
    #[serial]
    async fn it_suppresses_after_repeated_removals() {
        let harness = test_app().await;
        let root = harness.pipeline.config.vault_path.clone();
        write_note(&root, "concepts/Update.md", "What an update means.\n");
        let mut paths = Vec::new();
        for i in 0..5 {
            let rel = format!("daily-notes/log-{}.md", i);
            write_note(&root, &rel, "Engine linked [[Update]] here.\n");
            paths.push(rel);
        }
        harness
            .pipeline
            .process_items(
                std::iter::once("concepts/Update.md".to_string())
                    .chain(paths.iter().cloned())
                    .map(flywheel::pipeline::BatchItem::Upsert)
                    .collect(),
                true,
            )
            .await
            .unwrap();

        // The engine claims the links, then the user removes each.
        for rel in &paths {
            let rel = rel.clone();
            harness
                .pipeline
                .db
                .call(move |conn| {
                    flywheel::store::links::record_application(conn, &rel, "Update")?;
                    Ok(())
                })
                .await
                .unwrap();
        }
        for rel in &paths {
            write_note(&root, rel, "Engine linked nothing here.\n");
            harness
                .pipeline
                .process_items(
                    vec![flywheel::pipeline::BatchItem::Upsert(rel.clone())],
                    false,
                )
                .await
                .unwrap();
        }

        let (status, body) = get_json(&harness.app, "/feedback/dashboard").await;
        assert_eq!(status, StatusCode::OK);
        let folder_suppressed = body["folder_suppressed"].as_array().unwrap();
        assert!(
            folder_suppressed
                .iter()
                .any(|s| s["folder"] == "daily-notes" && s["entity"] == "Update"),
            "{:?}",
            folder_suppressed
        );
        // Five samples are short of the global bar.
        let suppressed = body["suppressed"].as_array().unwrap();
        assert!(!suppressed.iter().any(|s| s.as_str() == Some("Update")));
    }

    // With no token overlap at all, an entity can still surface
    // through its embedding, and that layer carries the score.
    #[tokio::test]
    #[serial]
    async fn it_discovers_semantic_only_candidates() {
        let harness = test_app().await;

        // Age the recency row so freshness does not mask the
        // semantic contribution, then rebuild the suggestion index.
        harness
            .pipeline
            .db
            .call(|conn| {
                conn.execute(
                    "UPDATE recency SET last_mentioned = last_mentioned - 800000
                     WHERE entity = 'CI-CD'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let (status, _) = post_json(&harness.app, "/notes/index", json!({})).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = post_json(
            &harness.app,
            "/notes/suggest",
            json!({
                "content": "Our deployment pipeline is slow",
                "path": "projects/infra.md",
                "strictness": "balanced",
                "detail": true,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let suggestions = body["suggestions"].as_array().unwrap();
        let ci = suggestions
            .iter()
            .find(|s| s["name"] == "CI-CD")
            .unwrap_or_else(|| panic!("CI-CD missing from {:?}", suggestions));
        let breakdown = &ci["breakdown"];
        assert_eq!(breakdown["content_match"], 0.0);
        let semantic = breakdown["semantic"].as_f64().unwrap();
        assert!(semantic > 0.0);
        for layer in [
            "content_match",
            "cooccurrence",
            "type_boost",
            "folder_context",
            "recency",
            "cross_folder",
            "hub",
            "feedback",
            "edge_weight",
        ] {
            assert!(
                semantic >= breakdown[layer].as_f64().unwrap(),
                "semantic should dominate, but {} = {:?}",
                layer,
                breakdown[layer]
            );
        }
    }

    // Writing rewritten text back is a no-op for the rewriter: the
    // second write adds no further links.
    #[tokio::test]
    #[serial]
    async fn it_is_idempotent_across_writes() {
        let harness = test_app().await;
        let (_, first) = post_json(
            &harness.app,
            "/notes/write",
            json!({
                "path": "daily-notes/idempotent.md",
                "content": "Turbopump delivery check.",
            }),
        )
        .await;
        assert!(!first["applied"].as_array().unwrap().is_empty());

        let text = first["text"].as_str().unwrap().to_string();
        assert!(text.contains("[[Turbopump]]"));

        // Re-run the pipeline over the new file, then append the
        // already-linked form again.
        harness
            .pipeline
            .process_items(
                vec![flywheel::pipeline::BatchItem::Upsert(
                    "daily-notes/idempotent.md".to_string(),
                )],
                false,
            )
            .await
            .unwrap();
        let (_, second) = post_json(
            &harness.app,
            "/notes/write",
            json!({
                "path": "daily-notes/idempotent.md",
                "content": "[[Turbopump]] delivery check.",
            }),
        )
        .await;
        assert!(second["applied"].as_array().unwrap().is_empty());
    }

    // The vault-wide link pass rewrites mentions in place but leaves
    // notes flagged with skipWikilinks untouched.
    #[tokio::test]
    #[serial]
    async fn it_links_the_vault_honoring_skip_flags() {
        let harness = test_app().await;
        let root = harness.pipeline.config.vault_path.clone();
        write_note(&root, "daily-notes/progress.md", "Discussing Turbopump progress.\n");
        write_note(
            &root,
            "daily-notes/private.md",
            "---\nskipWikilinks: true\n---\nTurbopump here.\n",
        );
        harness
            .pipeline
            .process_items(
                vec![
                    flywheel::pipeline::BatchItem::Upsert("daily-notes/progress.md".to_string()),
                    flywheel::pipeline::BatchItem::Upsert("daily-notes/private.md".to_string()),
                ],
                false,
            )
            .await
            .unwrap();

        let (status, body) = post_json(&harness.app, "/notes/link", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["links_added"].as_u64().unwrap() >= 1);
        assert!(body["notes_skipped"].as_u64().unwrap() >= 1);

        let progress = fs::read_to_string(root.join("daily-notes/progress.md")).unwrap();
        assert!(progress.contains("[[Turbopump]] progress"));
        let private = fs::read_to_string(root.join("daily-notes/private.md")).unwrap();
        assert!(!private.contains("[[Turbopump]]"));
    }

    #[tokio::test]
    #[serial]
    async fn it_reports_unlinked_mentions() {
        let harness = test_app().await;
        let root = harness.pipeline.config.vault_path.clone();
        write_note(
            &root,
            "daily-notes/mentions.md",
            "Turbopump twice: Turbopump. And [[Acme Corp]] linked.\n",
        );
        harness
            .pipeline
            .process_items(
                vec![flywheel::pipeline::BatchItem::Upsert(
                    "daily-notes/mentions.md".to_string(),
                )],
                false,
            )
            .await
            .unwrap();

        let (status, body) =
            get_json(&harness.app, "/notes/unlinked?path=daily-notes/mentions.md").await;
        assert_eq!(status, StatusCode::OK);
        let mentions = body["mentions"].as_array().unwrap();
        assert_eq!(
            mentions
                .iter()
                .filter(|m| m["entity"] == "Turbopump")
                .count(),
            2
        );
        assert!(!mentions.iter().any(|m| m["entity"] == "Acme Corp"));
    }
}
