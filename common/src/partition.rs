use crate::error::{MrError, Result};

/// Asigna una clave intermedia a una de R particiones de reduce.
///
/// Debe ser determinista durante todo el job: master y workers la evalúan
/// en procesos distintos. Un hash pobre produce particiones desbalanceadas
/// sin límite, pero eso no es un error.
pub trait Partitioner: Send + Sync {
    fn partition(&self, key: &[u8]) -> u32;
    fn num_partitions(&self) -> u32;
}

/// Política por defecto: FNV-1a de 64 bits sobre los bytes de la clave,
/// mezclado con el finalizador de murmur3 (FNV solo deja los bits bajos
/// dependiendo únicamente de los bits bajos de cada byte), módulo R.
///
/// El valor tiene que coincidir entre procesos: `DefaultHasher` no lo
/// garantiza.
#[derive(Debug, Clone, Copy)]
pub struct HashPartitioner {
    num_partitions: u32,
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

impl HashPartitioner {
    pub fn new(num_partitions: u32) -> Result<Self> {
        if num_partitions == 0 {
            return Err(MrError::config("num_reducers debe ser > 0"));
        }
        Ok(Self { num_partitions })
    }
}

impl Partitioner for HashPartitioner {
    fn partition(&self, key: &[u8]) -> u32 {
        (fmix64(fnv1a(key)) % self.num_partitions as u64) as u32
    }

    fn num_partitions(&self) -> u32 {
        self.num_partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn particion_en_rango_y_determinista() {
        for r in 1..=7 {
            let p = HashPartitioner::new(r).unwrap();
            for key in ["a", "b", "c", "xyz", "otro", ""] {
                let first = p.partition(key.as_bytes());
                assert!(first < r);
                for _ in 0..5 {
                    assert_eq!(p.partition(key.as_bytes()), first);
                }
                // otra instancia con el mismo R da lo mismo
                assert_eq!(HashPartitioner::new(r).unwrap().partition(key.as_bytes()), first);
            }
        }
    }

    #[test]
    fn no_depende_del_orden_de_llegada() {
        let p = HashPartitioner::new(4).unwrap();
        let keys: Vec<String> = (0..100).map(|i| format!("k{i}")).collect();
        let forward: Vec<u32> = keys.iter().map(|k| p.partition(k.as_bytes())).collect();
        let mut backward: Vec<u32> = keys.iter().rev().map(|k| p.partition(k.as_bytes())).collect();
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn reparte_claves_entre_todas_las_particiones() {
        let p = HashPartitioner::new(4).unwrap();
        let mut counts = [0u32; 4];
        for i in 0..1000 {
            counts[p.partition(format!("word{i}").as_bytes()) as usize] += 1;
        }
        assert!(counts.iter().all(|c| *c > 150), "reparto: {:?}", counts);
    }

    #[test]
    fn cero_particiones_es_error_de_config() {
        assert!(matches!(HashPartitioner::new(0), Err(MrError::Config(_))));
    }
}
