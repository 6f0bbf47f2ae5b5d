//! 外部サービスのインターフェース
//!
//! VMM が消費するホスト側サービス (VCPU・端末・単調タイマー・ROM) を
//! trait として定義します。実装はすべてコンストラクタで注入され、
//! プロセス全体のグローバル状態は持ちません。

use std::sync::{Arc, Mutex};

use crate::cpu::CpuState;
use crate::error::VmmError;

/// VCPU サービスと共有する CPU 状態ブロックへのハンドル
///
/// VCPU が停止している間だけ VMM がロックを取り読み書きする。
pub type SharedState = Arc<Mutex<CpuState>>;

/// VMM のイベントループへ届くイベント
///
/// すべてのイベントソースは同一スレッドのループで順番に処理される。
/// ハンドラ H が注入した IRQ は、H の次の VCPU エントリ以降でゲストから見える。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// VCPU からの VM Exit
    VcpuExit,
    /// ホストのワンショットタイマーが満了した
    TimerExpired,
    /// 端末に受信バイトがある
    TerminalRx,
}

/// ハードウェア仮想化コンテキストを所有するホスト VCPU サービス
pub trait VcpuService: Send {
    /// ホストが作成した共有 CPU 状態ブロック
    fn cpu_state(&self) -> SharedState;

    /// ゲスト物理アドレス空間へ RAM 領域を接続する
    fn attach_ram(&mut self, guest_addr: u64, size: usize) -> Result<(), VmmError>;

    /// ハードウェア仮想 CPU インターフェース (GICV) を接続する
    fn attach_pic(&mut self, guest_addr: u64) -> Result<(), VmmError>;

    /// ゲスト実行を再開する
    fn run(&mut self);

    /// ゲスト実行を停止する。戻った時点で Exit が共有状態へ反映されている
    fn pause(&mut self);
}

/// 双方向のバイトストリーム端末
pub trait Terminal: Send {
    fn write(&mut self, bytes: &[u8]);

    /// 受信バイトを読み出し、読めたバイト数を返す
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// 受信バイトが残っているか
    fn avail(&self) -> bool;
}

/// 相対ワンショットタイムアウトと経過ミリ秒カウンタを提供する単調タイマー
pub trait MonotonicTimer: Send + Sync {
    /// `microseconds` 後に一度だけ [`Event::TimerExpired`] を発火させる
    fn trigger_once(&self, microseconds: u64);

    fn elapsed_ms(&self) -> u64;
}

/// 名前付きバイナリブロブ ("linux", "dtb") の提供元
pub trait RomProvider: Send {
    fn request(&self, name: &str) -> Result<Vec<u8>, VmmError>;
}
