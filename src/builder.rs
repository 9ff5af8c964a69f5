//! Image and container builder
//!
//! Renders a Dockerfile for the site's stack, builds an image tagged with the
//! container name, and replaces any running container of that name with a new
//! one bound to the assigned host port.

use crate::error::OrchestratorError;
use crate::runtime::ContainerRuntime;
use crate::stack::Stack;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// File name of the generated build manifest
pub const MANIFEST_FILE: &str = "Dockerfile";

/// Render the build manifest for a stack
pub fn render_manifest(stack: Stack) -> String {
    match stack {
        Stack::Static => r#"# Generated by siteforge
FROM nginx:alpine

COPY . /usr/share/nginx/html

EXPOSE 80
"#
        .to_string(),

        Stack::Php => r#"# Generated by siteforge
FROM php:8.2-apache

COPY . /var/www/html/

EXPOSE 80
"#
        .to_string(),

        Stack::Node => format!(
            r#"# Generated by siteforge
FROM node:20-alpine

WORKDIR /app

COPY package*.json ./
RUN npm install --omit=dev

COPY . .

ENV PORT={port}
EXPOSE {port}

CMD ["npm", "start"]
"#,
            port = stack.internal_port()
        ),

        Stack::Python => format!(
            r#"# Generated by siteforge
FROM python:3.11-slim

WORKDIR /app

COPY . .
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; \
    elif [ -f Pipfile ]; then pip install --no-cache-dir pipenv && pipenv install --system --deploy; \
    elif [ -f pyproject.toml ]; then pip install --no-cache-dir .; fi

ENV PORT={port}
EXPOSE {port}

CMD ["python", "app.py"]
"#,
            port = stack.internal_port()
        ),
    }
}

/// Write the manifest into the workspace, replacing any existing one
pub fn write_manifest(workspace: &Path, stack: Stack) -> std::io::Result<PathBuf> {
    let path = workspace.join(MANIFEST_FILE);
    std::fs::write(&path, render_manifest(stack))?;
    info!(path = %path.display(), stack = %stack, "Generated Dockerfile");
    Ok(path)
}

/// Generate starter files for a template site.
///
/// Only missing files are created; anything already in the workspace is left
/// untouched. Returns the names of the files written.
pub fn write_starter_assets(
    workspace: &Path,
    stack: Stack,
    name: &str,
    slug: &str,
) -> std::io::Result<Vec<&'static str>> {
    let title = escape_html(name);
    let files: Vec<(&'static str, String)> = match stack {
        Stack::Static => vec![("index.html", static_index(&title))],
        Stack::Php => vec![("index.php", php_index(&title))],
        Stack::Node => vec![
            ("package.json", node_package(slug)),
            ("index.js", node_index(&title)),
        ],
        Stack::Python => vec![
            ("requirements.txt", "flask>=3.0\n".to_string()),
            ("app.py", python_app(&title)),
        ],
    };

    let mut written = Vec::new();
    for (file, contents) in files {
        let path = workspace.join(file);
        if path.exists() {
            debug!(path = %path.display(), "Keeping existing starter file");
            continue;
        }
        std::fs::write(&path, contents)?;
        written.push(file);
    }
    Ok(written)
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '$' => out.push_str("&#36;"),
            '`' => out.push_str("&#96;"),
            '\\' => out.push_str("&#92;"),
            _ => out.push(ch),
        }
    }
    out
}

fn static_index(title: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>{title}</title></head>
<body style="font-family: sans-serif; display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0;">
    <div style="text-align: center;">
        <h1>Hello from {title}!</h1>
        <p>This site is ready for content.</p>
    </div>
</body>
</html>
"#
    )
}

fn php_index(title: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>{title}</title></head>
<body style="font-family: sans-serif;">
    <h1>Hello from {title}!</h1>
    <p>PHP <?php echo htmlspecialchars(phpversion()); ?> is running.</p>
</body>
</html>
"#
    )
}

fn node_package(slug: &str) -> String {
    let package = serde_json::json!({
        "name": slug,
        "version": "1.0.0",
        "private": true,
        "main": "index.js",
        "scripts": { "start": "node index.js" },
        "dependencies": { "express": "^4.19.2" }
    });
    let mut text = serde_json::to_string_pretty(&package).unwrap_or_default();
    text.push('\n');
    text
}

/// Quote text as a string literal that is valid JavaScript and Python
fn string_literal(text: &str) -> String {
    serde_json::Value::from(text).to_string()
}

fn node_index(title: &str) -> String {
    let page = string_literal(&format!("<h1>Hello from {}!</h1><p>Node.js is listening on port ", title));
    format!(
        r#"const express = require('express');
const app = express();
const port = process.env.PORT || 3000;

app.get('/', (req, res) => {{
    res.send({page} + port + '</p>');
}});

app.listen(port, () => {{
    console.log('Listening on port ' + port);
}});
"#
    )
}

fn python_app(title: &str) -> String {
    let page = string_literal(&format!("<h1>Hello from {}!</h1><p>Flask is running.</p>", title));
    format!(
        r#"import os

from flask import Flask

app = Flask(__name__)


@app.route("/")
def index():
    return {page}


if __name__ == "__main__":
    app.run(host="0.0.0.0", port=int(os.environ.get("PORT", 5000)))
"#
    )
}

/// Everything needed to (re)deploy one site
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub workspace: PathBuf,
    pub container_name: String,
    pub stack: Stack,
    pub host_port: u16,
}

/// Outcome of a successful deploy
#[derive(Debug, Clone)]
pub struct DeployResult {
    pub image: String,
    pub container_id: String,
    pub internal_port: u16,
    pub duration_secs: f64,
}

/// Builds images and runs containers through the container runtime
#[derive(Clone)]
pub struct Builder {
    runtime: ContainerRuntime,
}

impl Builder {
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self { runtime }
    }

    /// Write the manifest, build, replace the old container and run the new one.
    ///
    /// The first failing step aborts the sequence; old images are kept.
    pub async fn deploy(&self, request: &DeployRequest) -> Result<DeployResult, OrchestratorError> {
        let start = std::time::Instant::now();
        let image = request.container_name.clone();
        let internal_port = request.stack.internal_port();

        write_manifest(&request.workspace, request.stack)?;

        info!(image = %image, context = %request.workspace.display(), "Building image");
        if let Err(e) = self.runtime.build_image(&image, &request.workspace).await {
            error!(image = %image, error = %e, "Image build failed");
            return Err(OrchestratorError::Build(e.to_string()));
        }

        self.runtime
            .force_remove(&request.container_name)
            .await
            .map_err(|e| OrchestratorError::Runtime(e.to_string()))?;

        let container_id = self
            .runtime
            .run_container(&request.container_name, &image, request.host_port, internal_port)
            .await
            .map_err(|e| {
                error!(container = %request.container_name, error = %e, "Container run failed");
                OrchestratorError::Runtime(e.to_string())
            })?;

        let duration = start.elapsed().as_secs_f64();
        info!(
            container = %request.container_name,
            port = request.host_port,
            duration_secs = %duration,
            "Deploy completed"
        );

        Ok(DeployResult {
            image,
            container_id,
            internal_port,
            duration_secs: duration,
        })
    }
}
