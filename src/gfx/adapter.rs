use log::{debug, info, warn};
use thiserror::Error;
use windows::Win32::Graphics::Direct3D::{
    D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1, D3D_FEATURE_LEVEL_12_0,
    D3D_FEATURE_LEVEL_12_1,
};
use windows::Win32::Graphics::Direct3D12::{D3D12CreateDevice, ID3D12Device};
use windows::Win32::Graphics::Dxgi::{
    DXGI_ADAPTER_FLAG_SOFTWARE, DXGI_ERROR_NOT_FOUND, IDXGIAdapter1, IDXGIFactory6,
};
use windows_core::Error as WinError;

/// Candidate feature tiers, best first. An adapter that supports none of these
/// is rejected outright.
pub const FEATURE_TIERS: [D3D_FEATURE_LEVEL; 4] = [
    D3D_FEATURE_LEVEL_12_1,
    D3D_FEATURE_LEVEL_12_0,
    D3D_FEATURE_LEVEL_11_1,
    D3D_FEATURE_LEVEL_11_0,
];

/// Set to `1` to skip enumeration and let the platform pick its default adapter.
pub const USE_DEFAULT_ADAPTER_ENV: &str = "HOLODESK_USE_DEFAULT_ADAPTER";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no hardware adapter supports the minimum feature tier")]
    NoSuitableAdapter,

    #[error("adapter enumeration failed: {0}")]
    Enumeration(#[from] WinError),
}

/// Ranking key for a qualified adapter. A lower `tier_rank` (index into
/// [`FEATURE_TIERS`]) is a higher feature tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub tier_rank: usize,
    pub dedicated_memory: u64,
}

/// Higher tier always wins; equal tiers break ties by strictly greater memory.
pub(crate) fn outranks(new: Candidate, best: Option<Candidate>) -> bool {
    match best {
        None => true,
        Some(best) => {
            new.tier_rank < best.tier_rank
                || (new.tier_rank == best.tier_rank && new.dedicated_memory > best.dedicated_memory)
        }
    }
}

/// Picks the hardware adapter to build the device on.
///
/// Returns `Ok(None)` when the environment override asks for the platform
/// default, in which case device creation passes no explicit adapter.
pub fn select_adapter(factory: &IDXGIFactory6) -> Result<Option<IDXGIAdapter1>, AdapterError> {
    if std::env::var(USE_DEFAULT_ADAPTER_ENV).is_ok_and(|v| v.starts_with('1')) {
        info!("adapter selection: using the platform default adapter");
        return Ok(None);
    }

    let mut best: Option<(IDXGIAdapter1, Candidate)> = None;

    for index in 0.. {
        let adapter = match unsafe { factory.EnumAdapters1(index) } {
            Ok(adapter) => adapter,
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
            Err(e) => return Err(e.into()),
        };

        let desc = unsafe { adapter.GetDesc1() }?;
        let name = adapter_name(&desc.Description);

        if (desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32) != 0 {
            debug!("skipping software adapter {name:?}");
            continue;
        }

        let Some(tier_rank) = probe_tier_rank(&adapter) else {
            warn!("adapter {name:?} rejected: insufficient feature tier");
            continue;
        };

        let candidate = Candidate {
            tier_rank,
            dedicated_memory: desc.DedicatedVideoMemory as u64,
        };
        if outranks(candidate, best.as_ref().map(|(_, c)| *c)) {
            best = Some((adapter, candidate));
        }
    }

    match best {
        Some((adapter, candidate)) => {
            let desc = unsafe { adapter.GetDesc1() }?;
            info!(
                "selected adapter {:?} ({} MiB dedicated, tier rank {})",
                adapter_name(&desc.Description),
                candidate.dedicated_memory / (1024 * 1024),
                candidate.tier_rank,
            );
            Ok(Some(adapter))
        }
        None => Err(AdapterError::NoSuitableAdapter),
    }
}

/// Highest feature tier the adapter supports, probed by trial device creation
/// with a null output (no device object is actually constructed).
fn probe_tier_rank(adapter: &IDXGIAdapter1) -> Option<usize> {
    FEATURE_TIERS.iter().position(|&tier| {
        unsafe { D3D12CreateDevice(adapter, tier, std::ptr::null_mut::<Option<ID3D12Device>>()) }
            .is_ok()
    })
}

fn adapter_name(description: &[u16; 128]) -> String {
    let len = description.iter().position(|&c| c == 0).unwrap_or(128);
    String::from_utf16_lossy(&description[..len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_tier_beats_more_memory() {
        let strong_tier = Candidate {
            tier_rank: 0,
            dedicated_memory: 256,
        };
        let big_memory = Candidate {
            tier_rank: 1,
            dedicated_memory: 1 << 40,
        };
        assert!(outranks(strong_tier, Some(big_memory)));
        assert!(!outranks(big_memory, Some(strong_tier)));
    }

    #[test]
    fn equal_tier_breaks_ties_by_strictly_greater_memory() {
        let small = Candidate {
            tier_rank: 2,
            dedicated_memory: 512,
        };
        let large = Candidate {
            tier_rank: 2,
            dedicated_memory: 1024,
        };
        assert!(outranks(large, Some(small)));
        assert!(!outranks(small, Some(large)));
        assert!(!outranks(small, Some(small)));
    }

    #[test]
    fn any_candidate_beats_none() {
        let worst = Candidate {
            tier_rank: FEATURE_TIERS.len() - 1,
            dedicated_memory: 0,
        };
        assert!(outranks(worst, None));
    }

    #[test]
    fn ranking_is_a_total_order() {
        let candidates = [
            Candidate {
                tier_rank: 0,
                dedicated_memory: 0,
            },
            Candidate {
                tier_rank: 1,
                dedicated_memory: 4096,
            },
            Candidate {
                tier_rank: 1,
                dedicated_memory: 2048,
            },
        ];
        // Exactly one winner survives a pairwise sweep regardless of order.
        let mut best: Option<Candidate> = None;
        for c in candidates {
            if outranks(c, best) {
                best = Some(c);
            }
        }
        assert_eq!(
            best,
            Some(Candidate {
                tier_rank: 0,
                dedicated_memory: 0
            })
        );
    }
}
