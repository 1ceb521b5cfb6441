//! PostgreSQL fleet store implementation.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::error::{FleetError, FleetResult};
use crate::types::{
    ConfigSnapshot, Device, DeviceKey, DeviceUid, Firmware, FirmwareId, FirmwareType,
    MetadataSnapshot, OrgId, Organisation, Profile, ProfileId, SlotKind, Slots, SnapshotId,
    TelemetryEntry,
};

use super::FleetStore;

/// PostgreSQL-backed fleet store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str, max_connections: u32) -> FleetResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        Ok(store)
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> FleetResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> FleetResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS organisations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                token TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL REFERENCES organisations(id),
                name TEXT NOT NULL,
                description TEXT,
                field_names JSONB NOT NULL,
                metadata_names JSONB NOT NULL,
                config_names JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (org_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                uid TEXT PRIMARY KEY,
                device_id BIGINT NOT NULL UNIQUE,
                name TEXT NOT NULL UNIQUE,
                readkey TEXT NOT NULL UNIQUE,
                writekey TEXT NOT NULL UNIQUE,
                profile_id TEXT NOT NULL REFERENCES profiles(id),
                current_firmware TEXT,
                previous_firmware TEXT,
                target_firmware TEXT,
                firmware_download_state TEXT NOT NULL,
                file_download_state BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS firmware (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL REFERENCES organisations(id),
                version TEXT NOT NULL,
                firmware_type TEXT NOT NULL,
                description TEXT,
                crc32 TEXT NOT NULL,
                size BIGINT NOT NULL,
                bin_path TEXT NOT NULL,
                hex_path TEXT,
                bootloader_path TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (org_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config_snapshots (
                id TEXT PRIMARY KEY,
                device_id BIGINT NOT NULL REFERENCES devices(device_id),
                slots JSONB NOT NULL,
                config_updated BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata_snapshots (
                id TEXT PRIMARY KEY,
                device_id BIGINT NOT NULL REFERENCES devices(device_id),
                slots JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS telemetry_entries (
                id TEXT PRIMARY KEY,
                device_id BIGINT NOT NULL REFERENCES devices(device_id),
                entry_id BIGINT NOT NULL,
                slots JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (device_id, entry_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_config_snapshots_device
             ON config_snapshots (device_id, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_metadata_snapshots_device
             ON metadata_snapshots (device_id, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_telemetry_entries_device
             ON telemetry_entries (device_id, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_devices_profile ON devices (profile_id)",
            "CREATE INDEX IF NOT EXISTS idx_firmware_org ON firmware (org_id)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Map an insert error, turning unique violations into conflicts.
    fn insert_error(e: sqlx::Error, what: &str) -> FleetError {
        let unique = e
            .as_database_error()
            .is_some_and(|db| db.is_unique_violation());
        if unique {
            FleetError::conflict(format!("{what} already exists"))
        } else {
            FleetError::Database(e)
        }
    }

    fn slots_from_row<K: SlotKind>(row: &PgRow, column: &str) -> FleetResult<Slots<K>> {
        let json: serde_json::Value = row.get(column);
        serde_json::from_value(json).map_err(|e| {
            FleetError::Serialisation(format!("failed to deserialise {column}: {e}"))
        })
    }

    fn slots_to_json<K: SlotKind>(slots: &Slots<K>) -> FleetResult<serde_json::Value> {
        serde_json::to_value(slots)
            .map_err(|e| FleetError::Serialisation(format!("failed to serialise slots: {e}")))
    }

    fn row_to_org(row: &PgRow) -> Organisation {
        Organisation {
            id: OrgId::new(row.get::<String, _>("id")),
            name: row.get("name"),
            token: row.get("token"),
            created_at: row.get("created_at"),
        }
    }

    fn row_to_profile(row: &PgRow) -> FleetResult<Profile> {
        Ok(Profile {
            id: ProfileId::new(row.get::<String, _>("id")),
            org_id: OrgId::new(row.get::<String, _>("org_id")),
            name: row.get("name"),
            description: row.get("description"),
            field_names: Self::slots_from_row(row, "field_names")?,
            metadata_names: Self::slots_from_row(row, "metadata_names")?,
            config_names: Self::slots_from_row(row, "config_names")?,
            created_at: row.get("created_at"),
        })
    }

    fn row_to_device(row: &PgRow) -> FleetResult<Device> {
        let state: String = row.get("firmware_download_state");
        let firmware_download_state = state.parse().map_err(FleetError::Serialisation)?;

        Ok(Device {
            uid: DeviceUid::new(row.get::<String, _>("uid")),
            device_id: row.get("device_id"),
            name: row.get("name"),
            readkey: DeviceKey::new(row.get::<String, _>("readkey")),
            writekey: DeviceKey::new(row.get::<String, _>("writekey")),
            profile_id: ProfileId::new(row.get::<String, _>("profile_id")),
            current_firmware: row
                .get::<Option<String>, _>("current_firmware")
                .map(FirmwareId::new),
            previous_firmware: row
                .get::<Option<String>, _>("previous_firmware")
                .map(FirmwareId::new),
            target_firmware: row
                .get::<Option<String>, _>("target_firmware")
                .map(FirmwareId::new),
            firmware_download_state,
            file_download_state: row.get("file_download_state"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_firmware(row: &PgRow) -> FleetResult<Firmware> {
        let firmware_type: String = row.get("firmware_type");
        let firmware_type = firmware_type.parse().map_err(FleetError::Serialisation)?;

        Ok(Firmware {
            id: FirmwareId::new(row.get::<String, _>("id")),
            org_id: OrgId::new(row.get::<String, _>("org_id")),
            version: row.get("version"),
            firmware_type,
            description: row.get("description"),
            crc32: row.get("crc32"),
            size: row.get("size"),
            bin_path: row.get("bin_path"),
            hex_path: row.get("hex_path"),
            bootloader_path: row.get("bootloader_path"),
            created_at: row.get("created_at"),
        })
    }

    fn row_to_config(row: &PgRow) -> FleetResult<ConfigSnapshot> {
        Ok(ConfigSnapshot {
            id: SnapshotId::new(row.get::<String, _>("id")),
            device_id: row.get("device_id"),
            values: Self::slots_from_row(row, "slots")?,
            config_updated: row.get("config_updated"),
            created_at: row.get("created_at"),
        })
    }

    fn row_to_metadata(row: &PgRow) -> FleetResult<MetadataSnapshot> {
        Ok(MetadataSnapshot {
            id: SnapshotId::new(row.get::<String, _>("id")),
            device_id: row.get("device_id"),
            values: Self::slots_from_row(row, "slots")?,
            created_at: row.get("created_at"),
        })
    }

    fn row_to_telemetry(row: &PgRow) -> FleetResult<TelemetryEntry> {
        Ok(TelemetryEntry {
            id: SnapshotId::new(row.get::<String, _>("id")),
            device_id: row.get("device_id"),
            entry_id: row.get("entry_id"),
            values: Self::slots_from_row(row, "slots")?,
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl FleetStore for PostgresStore {
    async fn insert_org(&self, org: &Organisation) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO organisations (id, name, token, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(org.id.as_str())
        .bind(&org.name)
        .bind(&org.token)
        .bind(org.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::insert_error(e, "organisation"))?;

        Ok(())
    }

    async fn get_org(&self, id: &OrgId) -> FleetResult<Option<Organisation>> {
        let row = sqlx::query(
            "SELECT id, name, token, created_at FROM organisations WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_to_org))
    }

    async fn find_org_by_token(&self, token: &str) -> FleetResult<Option<Organisation>> {
        let row = sqlx::query(
            "SELECT id, name, token, created_at FROM organisations WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_to_org))
    }

    async fn insert_profile(&self, profile: &Profile) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (
                id, org_id, name, description,
                field_names, metadata_names, config_names, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(profile.id.as_str())
        .bind(profile.org_id.as_str())
        .bind(&profile.name)
        .bind(&profile.description)
        .bind(Self::slots_to_json(&profile.field_names)?)
        .bind(Self::slots_to_json(&profile.metadata_names)?)
        .bind(Self::slots_to_json(&profile.config_names)?)
        .bind(profile.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::insert_error(e, "profile"))?;

        Ok(())
    }

    async fn get_profile(&self, id: &ProfileId) -> FleetResult<Option<Profile>> {
        let row = sqlx::query(
            r#"
            SELECT id, org_id, name, description,
                   field_names, metadata_names, config_names, created_at
            FROM profiles
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_profile).transpose()
    }

    async fn list_profiles(&self, org: &OrgId) -> FleetResult<Vec<Profile>> {
        let rows = sqlx::query(
            r#"
            SELECT id, org_id, name, description,
                   field_names, metadata_names, config_names, created_at
            FROM profiles
            WHERE org_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(org.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_profile).collect()
    }

    async fn insert_device(&self, device: &Device) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (
                uid, device_id, name, readkey, writekey, profile_id,
                current_firmware, previous_firmware, target_firmware,
                firmware_download_state, file_download_state,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(device.uid.as_str())
        .bind(device.device_id)
        .bind(&device.name)
        .bind(device.readkey.as_str())
        .bind(device.writekey.as_str())
        .bind(device.profile_id.as_str())
        .bind(device.current_firmware.as_ref().map(FirmwareId::as_str))
        .bind(device.previous_firmware.as_ref().map(FirmwareId::as_str))
        .bind(device.target_firmware.as_ref().map(FirmwareId::as_str))
        .bind(device.firmware_download_state.as_str())
        .bind(device.file_download_state)
        .bind(device.created_at)
        .bind(device.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::insert_error(e, "device"))?;

        Ok(())
    }

    async fn get_device(&self, device_id: i64) -> FleetResult<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE device_id = $1")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_device).transpose()
    }

    async fn get_device_in_org(&self, org: &OrgId, device_id: i64) -> FleetResult<Option<Device>> {
        let row = sqlx::query(
            r#"
            SELECT d.*
            FROM devices d
            INNER JOIN profiles p ON d.profile_id = p.id
            WHERE d.device_id = $1 AND p.org_id = $2
            "#,
        )
        .bind(device_id)
        .bind(org.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_device).transpose()
    }

    async fn find_device_by_name(&self, name: &str) -> FleetResult<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_device).transpose()
    }

    async fn find_device_by_writekey(&self, writekey: &str) -> FleetResult<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE writekey = $1")
            .bind(writekey)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_device).transpose()
    }

    async fn next_device_id(&self) -> FleetResult<i64> {
        let next: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(device_id), 0) + 1 FROM devices")
                .fetch_one(&self.pool)
                .await?;
        Ok(next)
    }

    async fn update_device(&self, device: &Device) -> FleetResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET name = $1, profile_id = $2,
                current_firmware = $3, previous_firmware = $4, target_firmware = $5,
                firmware_download_state = $6, file_download_state = $7,
                updated_at = $8
            WHERE uid = $9
            "#,
        )
        .bind(&device.name)
        .bind(device.profile_id.as_str())
        .bind(device.current_firmware.as_ref().map(FirmwareId::as_str))
        .bind(device.previous_firmware.as_ref().map(FirmwareId::as_str))
        .bind(device.target_firmware.as_ref().map(FirmwareId::as_str))
        .bind(device.firmware_download_state.as_str())
        .bind(device.file_download_state)
        .bind(device.updated_at)
        .bind(device.uid.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FleetError::not_found(
                "device",
                format!("uid {}", device.uid),
            ));
        }

        Ok(())
    }

    async fn list_devices(&self, org: &OrgId) -> FleetResult<Vec<Device>> {
        let rows = sqlx::query(
            r#"
            SELECT d.*
            FROM devices d
            INNER JOIN profiles p ON d.profile_id = p.id
            WHERE p.org_id = $1
            ORDER BY d.device_id
            "#,
        )
        .bind(org.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_device).collect()
    }

    async fn insert_firmware(&self, firmware: &Firmware) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO firmware (
                id, org_id, version, firmware_type, description,
                crc32, size, bin_path, hex_path, bootloader_path, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(firmware.id.as_str())
        .bind(firmware.org_id.as_str())
        .bind(&firmware.version)
        .bind(firmware.firmware_type.as_str())
        .bind(&firmware.description)
        .bind(&firmware.crc32)
        .bind(firmware.size)
        .bind(&firmware.bin_path)
        .bind(&firmware.hex_path)
        .bind(&firmware.bootloader_path)
        .bind(firmware.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::insert_error(e, "firmware version"))?;

        Ok(())
    }

    async fn get_firmware(&self, org: &OrgId, id: &FirmwareId) -> FleetResult<Option<Firmware>> {
        let row = sqlx::query("SELECT * FROM firmware WHERE id = $1 AND org_id = $2")
            .bind(id.as_str())
            .bind(org.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_firmware).transpose()
    }

    async fn get_firmware_by_id(&self, id: &FirmwareId) -> FleetResult<Option<Firmware>> {
        let row = sqlx::query("SELECT * FROM firmware WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_firmware).transpose()
    }

    async fn find_firmware_by_version(
        &self,
        org: &OrgId,
        version: &str,
    ) -> FleetResult<Option<Firmware>> {
        let row = sqlx::query("SELECT * FROM firmware WHERE org_id = $1 AND version = $2")
            .bind(org.as_str())
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_firmware).transpose()
    }

    async fn list_firmware(&self, org: &OrgId) -> FleetResult<Vec<Firmware>> {
        let rows = sqlx::query(
            "SELECT * FROM firmware WHERE org_id = $1 ORDER BY created_at DESC",
        )
        .bind(org.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_firmware).collect()
    }

    async fn set_firmware_type(
        &self,
        org: &OrgId,
        id: &FirmwareId,
        firmware_type: FirmwareType,
    ) -> FleetResult<()> {
        let result = sqlx::query(
            "UPDATE firmware SET firmware_type = $1 WHERE id = $2 AND org_id = $3",
        )
        .bind(firmware_type.as_str())
        .bind(id.as_str())
        .bind(org.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FleetError::not_found("firmware", format!("id {id}")));
        }

        Ok(())
    }

    async fn insert_config_snapshot(&self, snapshot: &ConfigSnapshot) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO config_snapshots (id, device_id, slots, config_updated, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(snapshot.id.as_str())
        .bind(snapshot.device_id)
        .bind(Self::slots_to_json(&snapshot.values)?)
        .bind(snapshot.config_updated)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_config_snapshots(&self, snapshots: &[ConfigSnapshot]) -> FleetResult<()> {
        let mut tx = self.pool.begin().await?;

        for snapshot in snapshots {
            sqlx::query(
                r#"
                INSERT INTO config_snapshots (id, device_id, slots, config_updated, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(snapshot.id.as_str())
            .bind(snapshot.device_id)
            .bind(Self::slots_to_json(&snapshot.values)?)
            .bind(snapshot.config_updated)
            .bind(snapshot.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn latest_config(&self, device_id: i64) -> FleetResult<Option<ConfigSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT id, device_id, slots, config_updated, created_at
            FROM config_snapshots
            WHERE device_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_config).transpose()
    }

    async fn acknowledge_config(&self, id: &SnapshotId) -> FleetResult<()> {
        let result = sqlx::query("UPDATE config_snapshots SET config_updated = TRUE WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(FleetError::not_found("config snapshot", format!("id {id}")));
        }

        Ok(())
    }

    async fn list_config_history(
        &self,
        device_id: i64,
        limit: u32,
    ) -> FleetResult<Vec<ConfigSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_id, slots, config_updated, created_at
            FROM config_snapshots
            WHERE device_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_config).collect()
    }

    async fn insert_metadata_snapshot(&self, snapshot: &MetadataSnapshot) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata_snapshots (id, device_id, slots, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(snapshot.id.as_str())
        .bind(snapshot.device_id)
        .bind(Self::slots_to_json(&snapshot.values)?)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_metadata(&self, device_id: i64) -> FleetResult<Option<MetadataSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT id, device_id, slots, created_at
            FROM metadata_snapshots
            WHERE device_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_metadata).transpose()
    }

    async fn list_metadata_history(
        &self,
        device_id: i64,
        limit: u32,
    ) -> FleetResult<Vec<MetadataSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_id, slots, created_at
            FROM metadata_snapshots
            WHERE device_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_metadata).collect()
    }

    async fn insert_telemetry(&self, entry: &TelemetryEntry) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO telemetry_entries (id, device_id, entry_id, slots, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.id.as_str())
        .bind(entry.device_id)
        .bind(entry.entry_id)
        .bind(Self::slots_to_json(&entry.values)?)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::insert_error(e, "telemetry entry"))?;

        Ok(())
    }

    async fn insert_telemetry_batch(&self, entries: &[TelemetryEntry]) -> FleetResult<()> {
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO telemetry_entries (id, device_id, entry_id, slots, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(entry.id.as_str())
            .bind(entry.device_id)
            .bind(entry.entry_id)
            .bind(Self::slots_to_json(&entry.values)?)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::insert_error(e, "telemetry entry"))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn next_entry_id(&self, device_id: i64) -> FleetResult<i64> {
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(entry_id), 0) + 1 FROM telemetry_entries WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }

    async fn latest_telemetry(&self, device_id: i64) -> FleetResult<Option<TelemetryEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, device_id, entry_id, slots, created_at
            FROM telemetry_entries
            WHERE device_id = $1
            ORDER BY created_at DESC, entry_id DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_telemetry).transpose()
    }

    async fn list_telemetry_history(
        &self,
        device_id: i64,
        limit: u32,
    ) -> FleetResult<Vec<TelemetryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_id, entry_id, slots, created_at
            FROM telemetry_entries
            WHERE device_id = $1
            ORDER BY created_at DESC, entry_id DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_telemetry).collect()
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
