use base64::{Engine, engine::general_purpose::URL_SAFE};
use clap::Subcommand;
use sqlx::{SqlitePool, types::time::UtcOffset};
use time::macros::format_description;

use crate::{
    route::validate_username,
    store,
    token::{TokenIssuer, TokenType},
};

/// Bytes of entropy in a generated signing secret.
const SECRET_LENGTH: usize = 32;

#[derive(Debug, Subcommand)]
pub enum AdminCommands {
    /// User related commands
    #[command(subcommand)]
    User(UserCommands),
    /// Print a freshly generated JWT signing secret
    Secret,
}

#[derive(Debug, Subcommand)]
pub enum UserCommands {
    /// List all users
    #[clap(visible_alias("ls"))]
    List,
    /// Remove a user and their messages
    #[clap(visible_alias("rm"))]
    Remove { id: i64 },
    /// Rename a user
    Rename { id: i64, new_username: String },
    /// Issue an access token for a user, e.g. for the smoke tests
    Token { id: i64 },
}

pub async fn admin(
    command: AdminCommands,
    pool: &SqlitePool,
    tokens: &TokenIssuer,
) -> anyhow::Result<()> {
    match command {
        AdminCommands::User(user_command) => match user_command {
            UserCommands::List => list_users(pool).await,
            UserCommands::Remove { id } => remove_user(pool, id).await,
            UserCommands::Rename { id, new_username } => {
                rename_user(pool, id, new_username).await
            }
            UserCommands::Token { id } => issue_token(pool, tokens, id).await,
        },
        AdminCommands::Secret => {
            println!("Generated JWT Secret: {}", generate_secret());
            Ok(())
        }
    }
}

async fn list_users(pool: &SqlitePool) -> anyhow::Result<()> {
    let local_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    for user in store::list_users(pool).await? {
        println!(
            "[{}] {} (created at: {})",
            user.id,
            user.username,
            user.created_at
                .to_offset(local_offset)
                .format(format_description!(
                    "[year]-[month]-[day] [hour]:[minute]:[second]"
                ))?
        );
    }

    Ok(())
}

async fn remove_user(pool: &SqlitePool, id: i64) -> anyhow::Result<()> {
    if store::remove_user(pool, id).await? == 0 {
        println!("No user found with ID {id}.");
    } else {
        println!("User with ID {id} removed successfully.");
    }

    Ok(())
}

async fn rename_user(pool: &SqlitePool, id: i64, new_username: String) -> anyhow::Result<()> {
    if let Err(reason) = validate_username(&new_username) {
        anyhow::bail!("Invalid username: {reason}");
    }

    let renamed = match store::rename_user(pool, id, &new_username).await {
        Ok(renamed) => renamed,
        Err(e) if store::is_unique_violation(&e) => anyhow::bail!("Username already exists"),
        Err(e) => return Err(e.into()),
    };
    if renamed == 0 {
        println!("No user found with ID {id}.");
    } else {
        println!("User with ID {id} renamed successfully.");
    }

    Ok(())
}

async fn issue_token(pool: &SqlitePool, tokens: &TokenIssuer, id: i64) -> anyhow::Result<()> {
    let Some(user) = store::user_by_id(pool, id).await? else {
        println!("No user found with ID {id}.");
        return Ok(());
    };

    let (token, claims) = tokens.issue(user.id, TokenType::Access)?;
    println!("Access token for '{}' [{}]:", user.username, user.id);
    println!("{token}");
    println!("Expires at (unix): {}", claims.exp);

    Ok(())
}

fn generate_secret() -> String {
    let bytes: [u8; SECRET_LENGTH] = rand::random();
    URL_SAFE.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_url_safe_and_random() {
        let a = generate_secret();
        let b = generate_secret();

        assert_ne!(a, b);
        assert_eq!(URL_SAFE.decode(&a).unwrap().len(), SECRET_LENGTH);
        assert!(!a.contains('+') && !a.contains('/'));
    }

    #[tokio::test]
    async fn user_commands_tolerate_unknown_ids() {
        let pool = store::memory_pool().await;
        let tokens = TokenIssuer::new("admin-test");
        let user = store::create_user(&pool, "alice", "hash", &[1]).await.unwrap();

        issue_token(&pool, &tokens, user.id).await.unwrap();
        // unknown ids are reported, not an error
        issue_token(&pool, &tokens, user.id + 1).await.unwrap();
        rename_user(&pool, user.id + 1, "nobody".into()).await.unwrap();
        remove_user(&pool, user.id + 1).await.unwrap();
        list_users(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn rename_follows_registration_rules() {
        let pool = store::memory_pool().await;
        let alice = store::create_user(&pool, "alice", "hash", &[1]).await.unwrap();
        store::create_user(&pool, "bob", "hash", &[1]).await.unwrap();

        let err = rename_user(&pool, alice.id, "al".into()).await.unwrap_err();
        assert!(err.to_string().contains("at least 3 characters"));
        assert!(rename_user(&pool, alice.id, "   ".into()).await.is_err());
        assert!(rename_user(&pool, alice.id, "a".repeat(51)).await.is_err());

        let err = rename_user(&pool, alice.id, "bob".into()).await.unwrap_err();
        assert_eq!(err.to_string(), "Username already exists");

        rename_user(&pool, alice.id, "alicia".into()).await.unwrap();
        let renamed = store::user_by_id(&pool, alice.id).await.unwrap().unwrap();
        assert_eq!(renamed.username, "alicia");
    }
}
