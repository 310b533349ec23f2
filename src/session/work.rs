use super::Session;
use crate::connection::Connection;
use crate::core::{PersistError, Result};
use async_trait::async_trait;
use tracing::{Level, event};

/// Caller logic run against the session's raw connection.
#[async_trait]
pub trait Work: Send {
    async fn execute(&mut self, connection: &mut Connection) -> Result<()>;
}

/// Like [`Work`], producing a value.
#[async_trait]
pub trait ReturningWork<T>: Send {
    async fn execute(&mut self, connection: &mut Connection) -> Result<T>;
}

impl Session {
    /// Runs `work` on a connection held only for its duration. The connection
    /// is handed back whether or not `work` fails. Tracked instances do not
    /// see what `work` changes; refresh them afterwards.
    pub async fn do_work<W: Work + ?Sized>(&mut self, work: &mut W) -> Result<()> {
        self.ensure_open()?;
        let mut connection = self.lease().await?;
        let outcome = work.execute(&mut connection).await;
        self.give_back(connection).await?;
        if let Err(err) = &outcome {
            event!(Level::WARN, session_id = self.id, error = %err, "work failed");
        }
        outcome
    }

    pub async fn do_returning_work<T, W: ReturningWork<T> + ?Sized>(
        &mut self,
        work: &mut W,
    ) -> Result<T> {
        self.ensure_open()?;
        let mut connection = self.lease().await?;
        let outcome = work.execute(&mut connection).await;
        self.give_back(connection).await?;
        if let Err(err) = &outcome {
            event!(Level::WARN, session_id = self.id, error = %err, "work failed");
        }
        outcome
    }

    /// Hands the caller-supplied connection back, leaving the session
    /// disconnected until [`Session::reconnect`].
    pub fn disconnect(&mut self) -> Result<Connection> {
        self.ensure_open()?;
        if !self.supplied_connection {
            return Err(PersistError::IllegalState(
                "Session was not opened with a caller-supplied connection".into(),
            ));
        }
        if self.in_transaction {
            return Err(PersistError::IllegalState(
                "cannot disconnect during a transaction".into(),
            ));
        }
        let connection = self
            .connection
            .take()
            .ok_or_else(|| PersistError::IllegalState("Session is already disconnected".into()))?;
        event!(Level::DEBUG, session_id = self.id, connection_id = connection.id(), "disconnected");
        Ok(connection)
    }

    pub fn reconnect(&mut self, connection: Connection) -> Result<()> {
        self.ensure_open()?;
        if !self.supplied_connection {
            return Err(PersistError::IllegalState(
                "Session was not opened with a caller-supplied connection".into(),
            ));
        }
        if self.connection.is_some() {
            return Err(PersistError::IllegalState("Session is already connected".into()));
        }
        event!(Level::DEBUG, session_id = self.id, connection_id = connection.id(), "reconnected");
        self.connection = Some(connection);
        Ok(())
    }
}
