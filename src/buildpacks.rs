//! Build descriptors for dynamic sites
//!
//! Each dynamic classification has a multi-stage Dockerfile template. The
//! template is only written when the repository has no Dockerfile of its own,
//! so a project can always bring its own build recipe.

use crate::site::Classification;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// File name of the build descriptor inside the working tree
pub const DOCKERFILE: &str = "Dockerfile";

const NODE_DOCKERFILE: &str = r#"# Generated by vibedeploy
FROM node:18-alpine AS builder
WORKDIR /app

# Install production dependencies
COPY package*.json ./
RUN npm install --production

COPY . .

# Production image
FROM node:18-alpine
WORKDIR /app

ENV NODE_ENV=production
ENV PORT=3000

COPY --from=builder /app ./

EXPOSE 3000
CMD ["npm", "start"]
"#;

const GO_DOCKERFILE: &str = r#"# Generated by vibedeploy
FROM golang:1.21-alpine AS builder
WORKDIR /app

# Download dependencies
COPY go.* ./
RUN go mod download

# Build application
COPY . .
RUN CGO_ENABLED=0 go build -o main .

# Production image
FROM alpine:latest
RUN apk --no-cache add ca-certificates
WORKDIR /root/

COPY --from=builder /app/main .

ENV PORT=8080

EXPOSE 8080
CMD ["./main"]
"#;

const PYTHON_DOCKERFILE: &str = r#"# Generated by vibedeploy
FROM python:3.11-slim AS builder
WORKDIR /app

# requirements.txt is optional
COPY requirements.txt* ./
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir --prefix=/install -r requirements.txt; else mkdir -p /install; fi

# Production image
FROM python:3.11-slim
WORKDIR /app

COPY --from=builder /install /usr/local
COPY . .

ENV PORT=8000
ENV PYTHONUNBUFFERED=1

EXPOSE 8000
CMD ["python", "main.py"]
"#;

/// What [`ImageBuilder::ensure_dockerfile`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorOutcome {
    /// A template was written at this path
    Generated(PathBuf),
    /// The repository already had a Dockerfile, left as is
    Existing(PathBuf),
    /// Static sites are not built
    NotNeeded,
}

/// Writes templated Dockerfiles into working trees
pub struct ImageBuilder;

impl ImageBuilder {
    /// Template for a classification, `None` for static sites
    pub fn template(classification: Classification) -> Option<&'static str> {
        match classification {
            Classification::Node => Some(NODE_DOCKERFILE),
            Classification::Go => Some(GO_DOCKERFILE),
            Classification::Python => Some(PYTHON_DOCKERFILE),
            Classification::Static => None,
        }
    }

    /// Make sure `work_dir` has a Dockerfile, writing the template if absent.
    ///
    /// The file is created with `create_new`, so an existing Dockerfile is
    /// never overwritten even if it appears between check and write.
    pub async fn ensure_dockerfile(
        work_dir: &Path,
        classification: Classification,
    ) -> std::io::Result<DescriptorOutcome> {
        let Some(template) = Self::template(classification) else {
            return Ok(DescriptorOutcome::NotNeeded);
        };

        let path = work_dir.join(DOCKERFILE);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;

        match file {
            Ok(mut file) => {
                file.write_all(template.as_bytes()).await?;
                file.flush().await?;
                info!(path = %path.display(), %classification, "Generated Dockerfile");
                Ok(DescriptorOutcome::Generated(path))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "Using existing Dockerfile");
                Ok(DescriptorOutcome::Existing(path))
            }
            Err(e) => Err(e),
        }
    }
}
