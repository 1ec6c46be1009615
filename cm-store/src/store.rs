//! Embedded relational store backing every other component: a `sqlx`
//! sqlite pool, point operations grouped by entity, complex fields
//! serialized into a JSON text column. `Add` fails with `AlreadyExist` on a
//! primary-key collision, `Update`/`Remove` fail with `NotFound` when the
//! row is absent — sqlx reports both as a constraint violation or a
//! `rows_affected() == 0`, translated here into this crate's error taxonomy.
//!
//! All mutating methods additionally serialize through `write_lock`: writes
//! need to be serializable w.r.t. the public operation that caused them,
//! which a bare connection pool alone doesn't
//! guarantee once a caller issues a read-modify-write across two queries
//! (e.g. `remove_network`'s reference check).

use std::path::Path;

use cm_proto::domain::{
    DesiredStatus, Host, InstanceIdent, InstanceInfo, InstanceState, Network, NetworkInstance,
    StorageStateInfo, UpdateItem, UpdateItemState, UpdateState,
};
use cm_proto::{CmError, CmResult, ErrorKind};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::Mutex;

use crate::migrations;

pub struct Store {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl Store {
    pub async fn open(db_path: impl AsRef<Path>) -> CmResult<Self> {
        let url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CmError::wrap(ErrorKind::Failed, "failed to open store", e))?;
        migrations::run(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    pub async fn open_in_memory() -> CmResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CmError::wrap(ErrorKind::Failed, "failed to open in-memory store", e))?;
        migrations::run(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    // ---- UpdateItem ----------------------------------------------------

    pub async fn add_update_item(&self, item: &UpdateItem) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "INSERT INTO update_items (item_id, version, item_type, owner_id, index_digest, state, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.item_id)
        .bind(&item.version)
        .bind(item_type_str(item.item_type))
        .bind(&item.owner_id)
        .bind(&item.index_digest)
        .bind(item_state_str(item.state))
        .bind(item.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                CmError::already_exist(format!("update item {}/{}", item.item_id, item.version)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_update_item(&self, item_id: &str, version: &str) -> CmResult<UpdateItem> {
        let row = sqlx::query(
            "SELECT item_id, version, item_type, owner_id, index_digest, state, timestamp
             FROM update_items WHERE item_id = ? AND version = ?",
        )
        .bind(item_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_update_item)
            .transpose()?
            .ok_or_else(|| CmError::not_found(format!("update item {item_id}/{version}")))
    }

    pub async fn list_update_items(&self) -> CmResult<Vec<UpdateItem>> {
        let rows = sqlx::query(
            "SELECT item_id, version, item_type, owner_id, index_digest, state, timestamp
             FROM update_items ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_update_item).collect()
    }

    pub async fn update_update_item_state(
        &self,
        item_id: &str,
        version: &str,
        state: UpdateItemState,
    ) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE update_items SET state = ? WHERE item_id = ? AND version = ?")
            .bind(item_state_str(state))
            .bind(item_id)
            .bind(version)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CmError::not_found(format!("update item {item_id}/{version}")));
        }
        Ok(())
    }

    pub async fn remove_update_item(&self, item_id: &str, version: &str) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM update_items WHERE item_id = ? AND version = ?")
            .bind(item_id)
            .bind(version)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CmError::not_found(format!("update item {item_id}/{version}")));
        }
        Ok(())
    }

    // ---- InstanceInfo ----------------------------------------------------

    pub async fn add_instance(&self, info: &InstanceInfo) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let info_json = serde_json::to_string(info)?;
        let result = sqlx::query(
            "INSERT INTO instances (item_id, subject_id, instance, version, info_json)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&info.ident.item_id)
        .bind(&info.ident.subject_id)
        .bind(info.ident.instance)
        .bind(&info.version)
        .bind(&info_json)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(CmError::already_exist(format!("instance {}/{}", info.ident, info.version)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_instance(&self, ident: &InstanceIdent, version: &str) -> CmResult<InstanceInfo> {
        let row = sqlx::query(
            "SELECT info_json FROM instances WHERE item_id = ? AND subject_id = ? AND instance = ? AND version = ?",
        )
        .bind(&ident.item_id)
        .bind(&ident.subject_id)
        .bind(ident.instance)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let json: String = row.get("info_json");
                Ok(serde_json::from_str(&json)?)
            }
            None => Err(CmError::not_found(format!("instance {ident}/{version}"))),
        }
    }

    pub async fn list_instances(&self) -> CmResult<Vec<InstanceInfo>> {
        let rows = sqlx::query("SELECT info_json FROM instances ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let json: String = row.get("info_json");
                Ok(serde_json::from_str(&json)?)
            })
            .collect()
    }

    pub async fn remove_instance(&self, ident: &InstanceIdent, version: &str) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "DELETE FROM instances WHERE item_id = ? AND subject_id = ? AND instance = ? AND version = ?",
        )
        .bind(&ident.item_id)
        .bind(&ident.subject_id)
        .bind(ident.instance)
        .bind(version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CmError::not_found(format!("instance {ident}/{version}")));
        }
        Ok(())
    }

    /// Rewrites the `state` field of an existing instance row in place
    /// (invariant 1: older versions may coexist but at most one is active).
    pub async fn set_instance_state(
        &self,
        ident: &InstanceIdent,
        version: &str,
        state: InstanceState,
    ) -> CmResult<()> {
        let mut info = self.get_instance(ident, version).await?;
        info.state = state;
        let info_json = serde_json::to_string(&info)?;
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE instances SET info_json = ? WHERE item_id = ? AND subject_id = ? AND instance = ? AND version = ?",
        )
        .bind(&info_json)
        .bind(&ident.item_id)
        .bind(&ident.subject_id)
        .bind(ident.instance)
        .bind(version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CmError::not_found(format!("instance {ident}/{version}")));
        }
        Ok(())
    }

    // ---- StorageStateInfo ------------------------------------------------

    pub async fn add_storage_state_info(&self, info: &StorageStateInfo) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "INSERT INTO storage_state_info
             (item_id, subject_id, instance, instance_uuid, storage_quota, state_quota, state_checksum)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&info.ident.item_id)
        .bind(&info.ident.subject_id)
        .bind(info.ident.instance)
        .bind(info.instance_id.to_string())
        .bind(info.storage_quota as i64)
        .bind(info.state_quota as i64)
        .bind(&info.state_checksum)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(CmError::already_exist(format!("storage state info {}", info.ident)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_storage_state_info(&self, ident: &InstanceIdent) -> CmResult<StorageStateInfo> {
        let row = sqlx::query(
            "SELECT instance_uuid, storage_quota, state_quota, state_checksum
             FROM storage_state_info WHERE item_id = ? AND subject_id = ? AND instance = ?",
        )
        .bind(&ident.item_id)
        .bind(&ident.subject_id)
        .bind(ident.instance)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_storage_state_info(ident.clone(), row),
            None => Err(CmError::not_found(format!("storage state info {ident}"))),
        }
    }

    /// Updates quotas in place.
    pub async fn update_storage_state_quotas(
        &self,
        ident: &InstanceIdent,
        storage_quota: u64,
        state_quota: u64,
    ) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE storage_state_info SET storage_quota = ?, state_quota = ?
             WHERE item_id = ? AND subject_id = ? AND instance = ?",
        )
        .bind(storage_quota as i64)
        .bind(state_quota as i64)
        .bind(&ident.item_id)
        .bind(&ident.subject_id)
        .bind(ident.instance)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CmError::not_found(format!("storage state info {ident}")));
        }
        Ok(())
    }

    /// Persists a newly accepted checksum.
    pub async fn update_storage_state_checksum(
        &self,
        ident: &InstanceIdent,
        checksum: &[u8],
    ) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE storage_state_info SET state_checksum = ?
             WHERE item_id = ? AND subject_id = ? AND instance = ?",
        )
        .bind(checksum)
        .bind(&ident.item_id)
        .bind(&ident.subject_id)
        .bind(ident.instance)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CmError::not_found(format!("storage state info {ident}")));
        }
        Ok(())
    }

    pub async fn remove_storage_state_info(&self, ident: &InstanceIdent) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "DELETE FROM storage_state_info WHERE item_id = ? AND subject_id = ? AND instance = ?",
        )
        .bind(&ident.item_id)
        .bind(&ident.subject_id)
        .bind(ident.instance)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CmError::not_found(format!("storage state info {ident}")));
        }
        Ok(())
    }

    // ---- Network / Host / NetworkInstance --------------------------------

    pub async fn add_network(&self, network: &Network) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("INSERT INTO networks (network_id, subnet, vlan_id) VALUES (?, ?, ?)")
            .bind(&network.network_id)
            .bind(&network.subnet)
            .bind(network.vlan_id as i64)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(CmError::already_exist(format!("network {}", network.network_id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_network(&self, network_id: &str) -> CmResult<Network> {
        let row = sqlx::query("SELECT network_id, subnet, vlan_id FROM networks WHERE network_id = ?")
            .bind(network_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_network)
            .ok_or_else(|| CmError::not_found(format!("network {network_id}")))
    }

    pub async fn list_networks(&self) -> CmResult<Vec<Network>> {
        let rows = sqlx::query("SELECT network_id, subnet, vlan_id FROM networks ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_network).collect())
    }

    /// Fails while any `Host` or `NetworkInstance` still references `network_id`.
    pub async fn remove_network(&self, network_id: &str) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let host_count: i64 = sqlx::query("SELECT COUNT(*) FROM hosts WHERE network_id = ?")
            .bind(network_id)
            .fetch_one(&self.pool)
            .await?
            .get(0);
        let instance_count: i64 =
            sqlx::query("SELECT COUNT(*) FROM network_instances WHERE network_id = ?")
                .bind(network_id)
                .fetch_one(&self.pool)
                .await?
                .get(0);
        if host_count > 0 || instance_count > 0 {
            return Err(CmError::new(
                ErrorKind::Failed,
                format!("network {network_id} still has {host_count} host(s) and {instance_count} instance(s) attached"),
            ));
        }

        let result = sqlx::query("DELETE FROM networks WHERE network_id = ?")
            .bind(network_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CmError::not_found(format!("network {network_id}")));
        }
        Ok(())
    }

    pub async fn add_host(&self, host: &Host) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("INSERT INTO hosts (network_id, node_id, ip) VALUES (?, ?, ?)")
            .bind(&host.network_id)
            .bind(host.node_id.0.clone())
            .bind(host.ip.to_string())
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(CmError::already_exist(
                format!("host {}/{}", host.network_id, host.node_id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_hosts(&self, network_id: &str) -> CmResult<Vec<Host>> {
        let rows = sqlx::query("SELECT network_id, node_id, ip FROM hosts WHERE network_id = ? ORDER BY rowid")
            .bind(network_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_host).collect()
    }

    /// Fails while any `NetworkInstance` on this network still belongs to
    /// `node_id`.
    pub async fn remove_host(&self, network_id: &str, node_id: &str) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let instance_count: i64 = sqlx::query(
            "SELECT COUNT(*) FROM network_instances WHERE network_id = ? AND node_id = ?",
        )
        .bind(network_id)
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?
        .get(0);
        if instance_count > 0 {
            return Err(CmError::new(
                ErrorKind::Failed,
                format!("host {network_id}/{node_id} still has {instance_count} instance(s) attached"),
            ));
        }

        let result = sqlx::query("DELETE FROM hosts WHERE network_id = ? AND node_id = ?")
            .bind(network_id)
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CmError::not_found(format!("host {network_id}/{node_id}")));
        }
        Ok(())
    }

    pub async fn add_network_instance(&self, ni: &NetworkInstance) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let info_json = serde_json::to_string(ni)?;
        let result = sqlx::query(
            "INSERT INTO network_instances (item_id, subject_id, instance, network_id, node_id, ip, info_json)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&ni.ident.item_id)
        .bind(&ni.ident.subject_id)
        .bind(ni.ident.instance)
        .bind(&ni.network_id)
        .bind(ni.node_id.0.clone())
        .bind(ni.ip.to_string())
        .bind(&info_json)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(CmError::already_exist(format!("network instance {}", ni.ident)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_network_instance(&self, ident: &InstanceIdent) -> CmResult<Option<NetworkInstance>> {
        let row = sqlx::query(
            "SELECT info_json FROM network_instances WHERE item_id = ? AND subject_id = ? AND instance = ?",
        )
        .bind(&ident.item_id)
        .bind(&ident.subject_id)
        .bind(ident.instance)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let json: String = row.get("info_json");
            Ok(serde_json::from_str(&json)?)
        })
        .transpose()
    }

    pub async fn list_network_instances(&self) -> CmResult<Vec<NetworkInstance>> {
        let rows = sqlx::query("SELECT info_json FROM network_instances ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let json: String = row.get("info_json");
                Ok(serde_json::from_str(&json)?)
            })
            .collect()
    }

    pub async fn ips_in_use(&self, network_id: &str) -> CmResult<Vec<std::net::IpAddr>> {
        let mut ips = Vec::new();
        for host in self.list_hosts(network_id).await? {
            ips.push(host.ip);
        }
        let rows = sqlx::query("SELECT ip FROM network_instances WHERE network_id = ?")
            .bind(network_id)
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let ip: String = row.get("ip");
            ips.push(ip.parse().map_err(|_| {
                CmError::new(ErrorKind::Failed, "corrupt ip address stored in network_instances")
            })?);
        }
        Ok(ips)
    }

    pub async fn remove_network_instance(&self, ident: &InstanceIdent) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "DELETE FROM network_instances WHERE item_id = ? AND subject_id = ? AND instance = ?",
        )
        .bind(&ident.item_id)
        .bind(&ident.subject_id)
        .bind(ident.instance)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CmError::not_found(format!("network instance {ident}")));
        }
        Ok(())
    }

    // ---- DesiredStatus / UpdateState -------------------------------------

    /// Last-write-wins document.
    pub async fn set_desired_status(&self, status: &DesiredStatus) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        let json = serde_json::to_string(status)?;
        sqlx::query("INSERT INTO desired_status (id, doc_json) VALUES (1, ?)
                     ON CONFLICT(id) DO UPDATE SET doc_json = excluded.doc_json")
            .bind(json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_desired_status(&self) -> CmResult<Option<DesiredStatus>> {
        let row = sqlx::query("SELECT doc_json FROM desired_status WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let json: String = row.get("doc_json");
            Ok(serde_json::from_str(&json)?)
        })
        .transpose()
    }

    pub async fn set_update_state(&self, state: UpdateState) -> CmResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE update_state SET state = ? WHERE id = 1")
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_update_state(&self) -> CmResult<UpdateState> {
        let row = sqlx::query("SELECT state FROM update_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        let state: String = row.get(0);
        state.parse()
    }
}

fn item_type_str(t: cm_proto::domain::UpdateItemType) -> &'static str {
    use cm_proto::domain::UpdateItemType::*;
    match t {
        Service => "service",
        Layer => "layer",
        Component => "component",
    }
}

fn item_state_str(s: UpdateItemState) -> &'static str {
    use UpdateItemState::*;
    match s {
        Pending => "pending",
        Installed => "installed",
        Cached => "cached",
        Removed => "removed",
    }
}

fn row_to_update_item(row: SqliteRow) -> CmResult<UpdateItem> {
    let item_type: String = row.get("item_type");
    let state: String = row.get("state");
    let timestamp: String = row.get("timestamp");
    Ok(UpdateItem {
        item_id: row.get("item_id"),
        item_type: match item_type.as_str() {
            "service" => cm_proto::domain::UpdateItemType::Service,
            "layer" => cm_proto::domain::UpdateItemType::Layer,
            "component" => cm_proto::domain::UpdateItemType::Component,
            other => {
                return Err(CmError::new(
                    ErrorKind::Failed,
                    format!("corrupt update item type '{other}' in store"),
                ))
            }
        },
        version: row.get("version"),
        owner_id: row.get("owner_id"),
        index_digest: row.get("index_digest"),
        state: match state.as_str() {
            "pending" => UpdateItemState::Pending,
            "installed" => UpdateItemState::Installed,
            "cached" => UpdateItemState::Cached,
            "removed" => UpdateItemState::Removed,
            other => {
                return Err(CmError::new(
                    ErrorKind::Failed,
                    format!("corrupt update item state '{other}' in store"),
                ))
            }
        },
        timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| CmError::wrap(ErrorKind::Failed, "corrupt timestamp in store", e))?
            .with_timezone(&chrono::Utc),
    })
}

fn row_to_storage_state_info(ident: InstanceIdent, row: SqliteRow) -> CmResult<StorageStateInfo> {
    let instance_uuid: String = row.get("instance_uuid");
    Ok(StorageStateInfo {
        ident,
        instance_id: uuid::Uuid::parse_str(&instance_uuid)
            .map_err(|e| CmError::wrap(ErrorKind::Failed, "corrupt instance uuid in store", e))?,
        storage_quota: row.get::<i64, _>("storage_quota") as u64,
        state_quota: row.get::<i64, _>("state_quota") as u64,
        state_checksum: row.get("state_checksum"),
    })
}

fn row_to_network(row: SqliteRow) -> Network {
    Network {
        network_id: row.get("network_id"),
        subnet: row.get("subnet"),
        vlan_id: row.get::<i64, _>("vlan_id") as u16,
    }
}

fn row_to_host(row: SqliteRow) -> CmResult<Host> {
    let ip: String = row.get("ip");
    Ok(Host {
        network_id: row.get("network_id"),
        node_id: cm_proto::domain::NodeId(row.get("node_id")),
        ip: ip
            .parse()
            .map_err(|_| CmError::new(ErrorKind::Failed, "corrupt ip address in store"))?,
    })
}
