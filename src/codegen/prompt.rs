use anyhow::Context;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::time::Duration;

use super::models::{DocLink, RepoAnalysis, Requirement};

/// Inputs folded into the instruction payload handed to the tool.
pub struct PromptInput<'a> {
    pub analysis: Option<&'a RepoAnalysis>,
    pub requirement: &'a Requirement,
    pub doc_content: &'a str,
    pub extra_context: &'a str,
}

const CODING_RULES: &[&str] = &[
    "Read the relevant existing files to learn the project layout and style before writing code.",
    "Follow the project's existing conventions for naming, directory layout and error handling.",
    "Write unit tests for new functionality.",
    "Run the project's build or compile command when done and fix any errors.",
    "Do not modify files unrelated to the requirement.",
];

pub fn build_prompt(input: &PromptInput<'_>) -> String {
    let mut out = String::from(
        "You are a senior software engineer writing code for a real project. \
         Stick strictly to the project's existing tech stack and code style.\n\n",
    );

    if let Some(analysis) = input.analysis {
        out.push_str("## Project context\n\n");
        if !analysis.tech_stack.is_empty() {
            let _ = writeln!(out, "Tech stack: {}", analysis.tech_stack.join(", "));
        }
        let fields = [
            ("Structure", &analysis.directory_structure),
            ("Naming", &analysis.naming),
            ("Error handling", &analysis.error_handling),
            ("Test framework", &analysis.test_framework),
        ];
        for (label, value) in fields {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                let _ = writeln!(out, "{}: {}", label, value);
            }
        }
        if !analysis.modules.is_empty() {
            out.push_str("\nModules:\n");
            for m in &analysis.modules {
                let _ = writeln!(
                    out,
                    "- {}: {} ({} files)",
                    m.path, m.description, m.files_count
                );
            }
        }
        out.push('\n');
    }

    out.push_str("## Requirement\n\n");
    let _ = write!(out, "### {}\n\n", input.requirement.title);
    out.push_str(&input.requirement.description);
    out.push_str("\n\n");

    if !input.doc_content.is_empty() {
        out.push_str("## Linked documents\n\n");
        out.push_str(input.doc_content);
        out.push_str("\n\n");
    }

    if !input.extra_context.is_empty() {
        out.push_str("## Additional notes\n\n");
        out.push_str(input.extra_context);
        out.push_str("\n\n");
    }

    out.push_str("## Coding rules\n\n");
    for (i, rule) in CODING_RULES.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, rule);
    }
    out
}

/// Fetches the text of a linked reference document.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, link: &DocLink) -> anyhow::Result<String>;
}

/// Fetches documents over HTTP(S) as plain text.
#[derive(Clone)]
pub struct HttpDocumentSource {
    client: reqwest::Client,
}

impl HttpDocumentSource {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentSource for HttpDocumentSource {
    async fn fetch(&self, link: &DocLink) -> anyhow::Result<String> {
        let body = self
            .client
            .get(&link.url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", link.url))?
            .error_for_status()
            .with_context(|| format!("Document request failed: {}", link.url))?
            .text()
            .await
            .context("Failed to read document body")?;
        Ok(body)
    }
}

/// Combined text of every linked document that could be fetched, plus how
/// many were fetched. Falls back to the requirement's stored document text
/// (with a count of 0) when nothing was fetched.
pub async fn gather_docs(
    source: Option<&dyn DocumentSource>,
    requirement: &Requirement,
) -> (String, usize) {
    let stored = || requirement.doc_content.clone().unwrap_or_default();
    let Some(source) = source else {
        return (stored(), 0);
    };

    let mut parts = Vec::new();
    for link in &requirement.docs {
        match source.fetch(link).await {
            Ok(content) if !content.trim().is_empty() => {
                let title = if link.title.is_empty() {
                    &link.url
                } else {
                    &link.title
                };
                parts.push(format!("### {}\n\n{}", title, content));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(title = %link.title, error = %e, "Skipping linked document");
            }
        }
    }

    if parts.is_empty() {
        (stored(), 0)
    } else {
        let count = parts.len();
        (parts.join("\n\n---\n\n"), count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::models::ModuleInfo;

    fn requirement() -> Requirement {
        Requirement {
            id: 42,
            title: "Add login".into(),
            description: "Users sign in with email.".into(),
            doc_content: Some("stored doc".into()),
            docs: vec![
                DocLink {
                    title: "API".into(),
                    url: "mem://api".into(),
                },
                DocLink {
                    title: String::new(),
                    url: "mem://untitled".into(),
                },
                DocLink {
                    title: "Broken".into(),
                    url: "mem://broken".into(),
                },
            ],
        }
    }

    struct FakeDocs;

    #[async_trait]
    impl DocumentSource for FakeDocs {
        async fn fetch(&self, link: &DocLink) -> anyhow::Result<String> {
            match link.url.as_str() {
                "mem://api" => Ok("POST /login".into()),
                "mem://untitled" => Ok("notes".into()),
                _ => anyhow::bail!("404"),
            }
        }
    }

    struct NoDocs;

    #[async_trait]
    impl DocumentSource for NoDocs {
        async fn fetch(&self, _link: &DocLink) -> anyhow::Result<String> {
            anyhow::bail!("offline")
        }
    }

    #[test]
    fn test_prompt_sections_in_order() {
        let analysis = RepoAnalysis {
            tech_stack: vec!["Rust".into(), "axum".into()],
            naming: Some("snake_case".into()),
            modules: vec![ModuleInfo {
                path: "src/api".into(),
                description: "HTTP handlers".into(),
                files_count: 4,
            }],
            ..Default::default()
        };
        let req = requirement();
        let prompt = build_prompt(&PromptInput {
            analysis: Some(&analysis),
            requirement: &req,
            doc_content: "DOCS",
            extra_context: "EXTRA",
        });

        assert!(prompt.contains("Tech stack: Rust, axum\n"));
        assert!(prompt.contains("Naming: snake_case\n"));
        assert!(!prompt.contains("Test framework:"));
        assert!(prompt.contains("- src/api: HTTP handlers (4 files)"));
        assert!(prompt.contains("### Add login\n\nUsers sign in with email."));

        let order = ["## Project context", "## Requirement", "## Linked documents", "## Additional notes", "## Coding rules"];
        let positions: Vec<usize> = order.iter().map(|h| prompt.find(h).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_prompt_omits_empty_sections() {
        let req = requirement();
        let prompt = build_prompt(&PromptInput {
            analysis: None,
            requirement: &req,
            doc_content: "",
            extra_context: "",
        });
        assert!(!prompt.contains("## Project context"));
        assert!(!prompt.contains("## Linked documents"));
        assert!(!prompt.contains("## Additional notes"));
        assert!(prompt.contains("5. Do not modify files unrelated"));
    }

    #[tokio::test]
    async fn test_gather_docs_joins_fetched_parts() {
        let (docs, count) = gather_docs(Some(&FakeDocs), &requirement()).await;
        assert_eq!(count, 2);
        assert_eq!(
            docs,
            "### API\n\nPOST /login\n\n---\n\n### mem://untitled\n\nnotes"
        );
    }

    #[tokio::test]
    async fn test_gather_docs_falls_back_to_stored_content() {
        let (docs, count) = gather_docs(Some(&NoDocs), &requirement()).await;
        assert_eq!((docs.as_str(), count), ("stored doc", 0));

        let (docs, count) = gather_docs(None, &requirement()).await;
        assert_eq!((docs.as_str(), count), ("stored doc", 0));
    }

    #[tokio::test]
    async fn test_http_document_source_fetches_text() {
        use axum::{Router, routing::get};

        let app = Router::new().route("/doc", get(|| async { "# Design\nbody" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let source = HttpDocumentSource::new().unwrap();
        let link = DocLink {
            title: "Design".into(),
            url: format!("http://{}/doc", addr),
        };
        assert_eq!(source.fetch(&link).await.unwrap(), "# Design\nbody");

        let missing = DocLink {
            title: "Missing".into(),
            url: format!("http://{}/nope", addr),
        };
        assert!(source.fetch(&missing).await.is_err());
    }
}
