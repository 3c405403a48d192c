use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Error};
use async_trait::async_trait;
use futures::StreamExt;
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    Cred, FetchOptions, RemoteCallbacks, Repository,
};
use log::{debug, info};
use rand::{distributions::Alphanumeric, Rng};
use tokio::io::AsyncWriteExt;

use crate::domain::{
    model::{AppSource, Artifact, GitSource, ReleaseSource},
    port::ArtifactResolver,
};

/// Fetches application bits onto the local disk. `file://` sources are used in
/// place, everything else is staged under `staging_dir` and removed once
/// uploaded.
pub struct LocalArtifactResolver {
    staging_dir: PathBuf,
    http: reqwest::Client,
}

impl LocalArtifactResolver {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn staging_path(&self, app_name: &str) -> Result<PathBuf, Error> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .with_context(|| format!("Can't create staging directory {}", self.staging_dir.display()))?;
        Ok(self.staging_dir.join(format!(
            "{}-{}",
            app_name,
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(7)
                .map(char::from)
                .collect::<String>()
        )))
    }

    async fn download(&self, request: reqwest::RequestBuilder, destination: &Path) -> Result<(), Error> {
        let response = request.send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(destination)
            .await
            .with_context(|| format!("Can't create {}", destination.display()))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn fetch_url(&self, app_name: &str, url: &str) -> Result<Artifact, Error> {
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(Artifact::Local {
                path: PathBuf::from(path),
                ephemeral: false,
            });
        }
        let destination = self.staging_path(app_name).await?;
        info!("Downloading application {} from url {}", app_name, url);
        self.download(self.http.get(url), &destination)
            .await
            .with_context(|| format!("Can't download {}", url))?;
        Ok(Artifact::Local {
            path: destination,
            ephemeral: true,
        })
    }

    async fn fetch_release(&self, app_name: &str, release: &ReleaseSource) -> Result<Artifact, Error> {
        let url = format!(
            "https://github.com/{}/{}/releases/download/{}/{}",
            release.owner, release.repo, release.version, release.filename
        );
        let directory = self.staging_path(app_name).await?;
        tokio::fs::create_dir_all(&directory).await?;
        let mut request = self.http.get(&url);
        if let Some(user) = &release.user {
            request = request.basic_auth(user, release.password.as_ref());
        }
        info!("Downloading release {} of {}/{}", release.version, release.owner, release.repo);
        self.download(request, &directory.join(&release.filename))
            .await
            .with_context(|| format!("Can't download {}", url))?;
        Ok(Artifact::Local {
            path: directory,
            ephemeral: true,
        })
    }

    async fn fetch_git(&self, app_name: &str, git: &GitSource) -> Result<Artifact, Error> {
        let destination = self.staging_path(app_name).await?;
        let git = git.clone();
        let local_dir = destination.clone();
        info!("Clone git repository {}", git.url);
        tokio::task::spawn_blocking(move || clone(&git, &local_dir))
            .await
            .map_err(|e| anyhow!("clone task failed: {}", e))??;
        Ok(Artifact::Local {
            path: destination,
            ephemeral: true,
        })
    }
}

fn clone(git: &GitSource, local_dir: &Path) -> Result<(), Error> {
    let mut callbacks = RemoteCallbacks::new();
    let (user, password, key) = (git.user.clone(), git.password.clone(), git.key.clone());
    callbacks.credentials(move |_url, username_from_url, _allowed| match &key {
        Some(key) => Cred::ssh_key_from_memory(
            user.as_deref().or(username_from_url).unwrap_or("git"),
            None,
            key,
            password.as_deref(),
        ),
        None => Cred::userpass_plaintext(
            user.as_deref().unwrap_or_default(),
            password.as_deref().unwrap_or_default(),
        ),
    });
    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(callbacks);

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch_options);
    if let Some(branch) = &git.branch {
        builder.branch(branch);
    }
    let repository = builder
        .clone(&git.url, local_dir)
        .with_context(|| format!("Can't clone {}", git.url))?;
    if let Some(tag) = &git.tag {
        checkout_tag(&repository, tag)?;
    }
    debug!("Cloned {} into {}", git.url, local_dir.display());
    std::fs::remove_dir_all(local_dir.join(".git")).context("Can't drop git metadata")
}

fn checkout_tag(repository: &Repository, tag: &str) -> Result<(), Error> {
    let commit = repository
        .revparse_single(&format!("refs/tags/{}", tag))
        .with_context(|| format!("Tag {} not found", tag))?
        .peel_to_commit()?;
    repository.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
    repository.set_head_detached(commit.id())?;
    Ok(())
}

#[async_trait]
impl ArtifactResolver for LocalArtifactResolver {
    async fn resolve(&self, app_name: &str, source: &AppSource) -> Result<Artifact, Error> {
        match source {
            AppSource::Url(url) => self.fetch_url(app_name, url).await,
            AppSource::Git(git) => self.fetch_git(app_name, git).await,
            AppSource::GithubRelease(release) => self.fetch_release(app_name, release).await,
            AppSource::Docker(docker) => Ok(Artifact::Image(docker.image.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use git2::Signature;

    use super::*;
    use crate::domain::model::DockerSource;

    #[tokio::test]
    async fn file_urls_are_used_in_place() {
        let staging = tempfile::tempdir().unwrap();
        let resolver = LocalArtifactResolver::new(staging.path());

        let artifact = resolver
            .resolve("web", &AppSource::Url("file:///srv/web.zip".to_string()))
            .await
            .unwrap();

        assert_eq!(
            artifact,
            Artifact::Local {
                path: PathBuf::from("/srv/web.zip"),
                ephemeral: false,
            }
        );
    }

    #[tokio::test]
    async fn docker_sources_resolve_to_their_image() {
        let staging = tempfile::tempdir().unwrap();
        let resolver = LocalArtifactResolver::new(staging.path());

        let artifact = resolver
            .resolve(
                "web",
                &AppSource::Docker(DockerSource {
                    image: "nginx:1.27".to_string(),
                    credentials: None,
                }),
            )
            .await
            .unwrap();

        assert_eq!(artifact, Artifact::Image("nginx:1.27".to_string()));
    }

    fn commit<'r>(
        repository: &'r Repository,
        workdir: &Path,
        file: &str,
        parents: &[&git2::Commit<'_>],
    ) -> git2::Commit<'r> {
        std::fs::write(workdir.join(file), file).unwrap();
        let mut index = repository.index().unwrap();
        index.add_path(Path::new(file)).unwrap();
        index.write().unwrap();
        let tree = repository.find_tree(index.write_tree().unwrap()).unwrap();
        let signature = Signature::now("dev", "dev@example.com").unwrap();
        let id = repository
            .commit(Some("HEAD"), &signature, &signature, file, &tree, parents)
            .unwrap();
        repository.find_commit(id).unwrap()
    }

    #[tokio::test]
    async fn git_sources_are_cloned_at_the_requested_tag() {
        let origin = tempfile::tempdir().unwrap();
        let repository = Repository::init(origin.path()).unwrap();
        let first = commit(&repository, origin.path(), "v1.txt", &[]);
        repository
            .tag_lightweight("v1.0.0", first.as_object(), false)
            .unwrap();
        commit(&repository, origin.path(), "v2.txt", &[&first]);

        let staging = tempfile::tempdir().unwrap();
        let resolver = LocalArtifactResolver::new(staging.path());
        let artifact = resolver
            .resolve(
                "web",
                &AppSource::Git(GitSource {
                    url: origin.path().display().to_string(),
                    branch: None,
                    tag: Some("v1.0.0".to_string()),
                    user: None,
                    password: None,
                    key: None,
                }),
            )
            .await
            .unwrap();

        let Artifact::Local { path, ephemeral } = artifact else {
            panic!("local artifact expected");
        };
        assert!(ephemeral);
        assert!(path.starts_with(staging.path()));
        assert!(path.join("v1.txt").exists());
        assert!(!path.join("v2.txt").exists());
        assert!(!path.join(".git").exists());
    }
}
